//! Method+path restrictions.
//!
//! Entries are evaluated against `(method, path)`; method `*` matches any,
//! path regexes are anchored at compile time. With `allowLast` unset an
//! `allowed` hit admits the request before forbidden/not-found are consulted;
//! with `allowLast` set the deny lists are consulted first. A request
//! matching no list falls through to the next gate stage.

use crate::store::CompiledService;
use portcullis_types::error::{GatewayError, GatewayResult};
use regex::Regex;

fn any_match(entries: &[(String, Regex)], method: &str, path: &str) -> bool {
    entries
        .iter()
        .any(|(m, re)| (m == "*" || m.eq_ignore_ascii_case(method)) && re.is_match(path))
}

/// Evaluate the service's restrictions for one request.
pub fn check(service: &CompiledService, method: &str, path: &str) -> GatewayResult<()> {
    if !service.descriptor.restrictions.enabled {
        return Ok(());
    }

    let allowed = || any_match(&service.allowed, method, path);
    let forbidden = || any_match(&service.forbidden, method, path);
    let not_found = || any_match(&service.not_found, method, path);

    if !service.descriptor.restrictions.allow_last && allowed() {
        return Ok(());
    }
    if forbidden() {
        return Err(GatewayError::RestrictionForbidden { path: path.to_string() });
    }
    if not_found() {
        return Err(GatewayError::RestrictionNotFound { path: path.to_string() });
    }
    Ok(())
}
