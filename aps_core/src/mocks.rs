//! Test and helper mocks for aps_core

use crate::config::Profile;
use crate::error::ApsError;
use crate::middleware::{MiddlewareContext, ProfileMiddleware};
use crate::sensitivity::AutosensResult;

/// A middleware that panics; exercises the sandbox fallback.
pub struct PanickingMiddleware;

impl ProfileMiddleware for PanickingMiddleware {
    fn name(&self) -> &str {
        "panicking"
    }

    #[allow(clippy::panic)]
    fn apply(
        &self,
        _profile: &mut Profile,
        _autosens: &mut AutosensResult,
        _ctx: &MiddlewareContext<'_>,
    ) -> Result<Option<String>, ApsError> {
        panic!("middleware blew up")
    }
}

/// A middleware that always returns an error.
pub struct FailingMiddleware;

impl ProfileMiddleware for FailingMiddleware {
    fn name(&self) -> &str {
        "failing"
    }

    fn apply(
        &self,
        _profile: &mut Profile,
        _autosens: &mut AutosensResult,
        _ctx: &MiddlewareContext<'_>,
    ) -> Result<Option<String>, ApsError> {
        Err(ApsError::InvalidInput("script error".into()))
    }
}

/// Scales ISF by a fixed factor.
pub struct ScaleIsfMiddleware(pub f64);

impl ProfileMiddleware for ScaleIsfMiddleware {
    fn name(&self) -> &str {
        "scale_isf"
    }

    fn apply(
        &self,
        profile: &mut Profile,
        _autosens: &mut AutosensResult,
        _ctx: &MiddlewareContext<'_>,
    ) -> Result<Option<String>, ApsError> {
        profile.sens *= self.0;
        Ok(Some(format!("ISF x{}", self.0)))
    }
}

/// Overwrites the sensitivity ratio without touching the profile.
pub struct FixedRatioMiddleware(pub f64);

impl ProfileMiddleware for FixedRatioMiddleware {
    fn name(&self) -> &str {
        "fixed_ratio"
    }

    fn apply(
        &self,
        _profile: &mut Profile,
        autosens: &mut AutosensResult,
        _ctx: &MiddlewareContext<'_>,
    ) -> Result<Option<String>, ApsError> {
        autosens.ratio = self.0;
        Ok(Some(format!("ratio {}", self.0)))
    }
}
