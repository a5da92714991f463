#![no_main]
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &str| {
    // Parse errors and validation errors are fine; panics are not.
    let Ok(cfg) = aps_config::load_toml(data) else {
        return;
    };
    if cfg.validate().is_ok() {
        // A validated config must always convert into a profile.
        let _ = aps_core::Profile::try_from(&cfg);
    }
});
