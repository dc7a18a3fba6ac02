use crate::error::CallError;

/// Turns what the user typed into a SIP URI.
///
/// `bob` becomes `sip:bob@<domain>`, `bob@host` gets the `sip:` scheme and
/// anything already carrying a scheme is only validated.
pub fn normalize_target(target: &str, domain: Option<&str>) -> Result<rsip::Uri, CallError> {
    let target = target.trim();
    if target.is_empty() || target.chars().any(char::is_whitespace) {
        return Err(CallError::InvalidTarget(target.to_string()));
    }

    let text = if target.starts_with("sip:") || target.starts_with("sips:") {
        target.to_string()
    } else if target.contains('@') {
        format!("sip:{}", target)
    } else {
        match domain {
            Some(domain) if !domain.is_empty() => format!("sip:{}@{}", target, domain),
            _ => return Err(CallError::InvalidTarget(target.to_string())),
        }
    };

    let uri = rsip::Uri::try_from(text.as_str())
        .map_err(|e| CallError::InvalidTarget(format!("{}: {}", target, e)))?;
    let has_user = uri
        .auth
        .as_ref()
        .map(|a| !a.user.is_empty())
        .unwrap_or(false);
    if !has_user || uri.host_with_port.host.to_string().is_empty() {
        return Err(CallError::InvalidTarget(target.to_string()));
    }
    Ok(uri)
}
