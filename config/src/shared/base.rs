use thiserror::Error;

/// Configuration validation errors.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ValidationError {
    /// A field holds a value outside of its accepted range.
    #[error("invalid value for `{field}`: {constraint}")]
    InvalidFieldValue { field: String, constraint: String },
    /// An address is not in `host:port` form.
    #[error("invalid address `{0}`, expected `host:port`")]
    InvalidAddress(String),
    /// A destination needs at least one address.
    #[error("endpoint `{0}` requires at least one address")]
    MissingAddress(&'static str),
    /// Two rules target the same table.
    #[error("duplicate rule for table `{0}`")]
    DuplicateRule(String),
}

/// Splits a `host:port` address.
///
/// IPv6 literals must be bracketed, as in `[::1]:6379`.
pub fn parse_address(address: &str) -> Result<(String, u16), ValidationError> {
    let invalid = || ValidationError::InvalidAddress(address.to_string());

    let (host, port) = address.rsplit_once(':').ok_or_else(invalid)?;
    let host = host.trim_start_matches('[').trim_end_matches(']');
    if host.is_empty() {
        return Err(invalid());
    }
    let port = port.parse::<u16>().map_err(|_| invalid())?;

    Ok((host.to_string(), port))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_host_and_port() {
        assert_eq!(
            parse_address("127.0.0.1:6379").unwrap(),
            ("127.0.0.1".to_string(), 6379)
        );
        assert_eq!(parse_address("[::1]:9092").unwrap(), ("::1".to_string(), 9092));
    }

    #[test]
    fn rejects_malformed_addresses() {
        assert!(parse_address("localhost").is_err());
        assert!(parse_address(":6379").is_err());
        assert!(parse_address("host:port").is_err());
    }
}
