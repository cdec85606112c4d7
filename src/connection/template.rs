//! Connection target resolution.
//!
//! Backend URLs may carry `${USER}` / `${PASSWORD}` placeholders that are
//! filled from the caller's session properties, and impersonation rewrites
//! the authority so statements run as the requesting principal. Both steps
//! happen before any network call.

use std::collections::HashMap;
use std::sync::OnceLock;

use regex::Regex;
use url::Url;

use super::{Principal, SessionProperty};
use crate::config::{mask_password, BackendConfig};
use crate::error::{ConduitError, Result};

fn placeholder_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)\}").expect("placeholder pattern is valid")
    })
}

/// Substitutes `${USER}` and `${PASSWORD}` in a URL template.
///
/// `USER` defaults to the principal's name and is overridden by a `user`
/// session property; `PASSWORD` only comes from a `password` property.
/// Caller-supplied properties win over backend `defaults`. A template
/// without placeholders is returned unchanged.
pub fn resolve_url(
    template: &str,
    principal: &Principal,
    defaults: &[SessionProperty],
) -> Result<String> {
    if !template.contains("${") {
        return Ok(template.to_string());
    }

    let mut vars: HashMap<&str, &str> = HashMap::new();
    vars.insert("USER", principal.username.as_str());
    for prop in defaults.iter().chain(principal.properties.iter()) {
        if prop.name.eq_ignore_ascii_case("user") {
            vars.insert("USER", prop.value.as_str());
        } else if prop.name.eq_ignore_ascii_case("password") {
            vars.insert("PASSWORD", prop.value.as_str());
        }
    }

    let mut missing_credentials = false;
    let mut unknown = Vec::new();
    for caps in placeholder_pattern().captures_iter(template) {
        let name = &caps[1];
        match name {
            "USER" | "PASSWORD" if !vars.contains_key(name) => missing_credentials = true,
            "USER" | "PASSWORD" => {}
            other => unknown.push(other.to_string()),
        }
    }

    if !unknown.is_empty() {
        return Err(ConduitError::config(format!(
            "Unresolvable URL template variables: {}",
            unknown.join(", ")
        )));
    }
    if missing_credentials {
        return Err(ConduitError::auth("Missing username and/or password"));
    }

    let resolved = placeholder_pattern().replace_all(template, |caps: &regex::Captures| {
        vars.get(&caps[1]).copied().unwrap_or_default().to_string()
    });
    Ok(resolved.into_owned())
}

/// Embeds the acting principal into the authority segment of a URL.
pub fn apply_impersonation(raw: &str, username: &str) -> Result<String> {
    let not_found = || {
        ConduitError::config(format!(
            "Driver name of {} could not be found and impersonation is turned on",
            mask_password(raw)
        ))
    };

    let mut url = Url::parse(raw).map_err(|_| not_found())?;
    if url.host_str().is_none() {
        return Err(not_found());
    }
    url.set_username(username).map_err(|_| not_found())?;
    Ok(url.to_string())
}

/// Resolves the final connection URL of a URL-based backend.
pub fn connection_url(backend: &BackendConfig, principal: &Principal) -> Result<String> {
    let template = backend
        .url
        .as_deref()
        .ok_or_else(|| ConduitError::config("Backend has no connection url"))?;

    let url = resolve_url(template, principal, &backend.session.properties)?;

    if backend.has_impersonation {
        apply_impersonation(&url, &principal.username)
    } else {
        Ok(url)
    }
}
