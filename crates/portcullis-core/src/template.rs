//! Header-value template expansion.
//!
//! `additionalHeaders` values may reference the call context through a small
//! fixed symbol table: `${apikey.name}`, `${apikey.clientId}`,
//! `${apikey.metadata.<key>}`, `${user.name}`, `${user.email}`,
//! `${req.header.<name>}` and `${req.query.<name>}`. Unresolved references
//! expand to the empty string.

use once_cell::sync::Lazy;
use portcullis_types::models::{ApiKey, PrivateAppsUser};
use regex::Regex;
use std::collections::HashMap;

static PLACEHOLDER: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\$\{([a-zA-Z0-9_.\-]+)\}").unwrap());

/// Symbols available while expanding one request's headers.
pub struct TemplateContext<'a> {
    /// API key that admitted the call
    pub apikey: Option<&'a ApiKey>,
    /// Private-app user bound to the call
    pub user: Option<&'a PrivateAppsUser>,
    /// Inbound request headers, lowercased names
    pub headers: &'a HashMap<String, String>,
    /// Inbound query parameters
    pub query: &'a HashMap<String, String>,
}

impl TemplateContext<'_> {
    fn resolve(&self, symbol: &str) -> Option<String> {
        if let Some(rest) = symbol.strip_prefix("apikey.") {
            let key = self.apikey?;
            return match rest {
                "name" => Some(key.client_name.clone()),
                "clientId" => Some(key.client_id.clone()),
                _ => rest
                    .strip_prefix("metadata.")
                    .and_then(|meta| key.metadata.get(meta).cloned()),
            };
        }
        if let Some(rest) = symbol.strip_prefix("user.") {
            let user = self.user?;
            return match rest {
                "name" => Some(user.name.clone()),
                "email" => Some(user.email.clone()),
                _ => None,
            };
        }
        if let Some(name) = symbol.strip_prefix("req.header.") {
            return self.headers.get(&name.to_ascii_lowercase()).cloned();
        }
        if let Some(name) = symbol.strip_prefix("req.query.") {
            return self.query.get(name).cloned();
        }
        None
    }
}

/// Expand every `${...}` reference in `template`.
pub fn expand(template: &str, ctx: &TemplateContext<'_>) -> String {
    PLACEHOLDER
        .replace_all(template, |caps: &regex::Captures<'_>| {
            ctx.resolve(&caps[1]).unwrap_or_default()
        })
        .into_owned()
}
