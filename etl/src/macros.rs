//! Shorthands for building [`crate::error::EtlError`]s.

/// Builds an [`crate::error::EtlError`] from a kind, a static description and an optional
/// detail rendered with [`ToString`].
///
/// ```ignore
/// let err = etl_error!(ErrorKind::SchemaDrift, "Row width mismatch", format!("{width} columns"));
/// ```
#[macro_export]
macro_rules! etl_error {
    ($kind:expr, $desc:expr $(,)?) => {
        $crate::error::EtlError::from(($kind, $desc))
    };
    ($kind:expr, $desc:expr, $detail:expr $(,)?) => {
        $crate::error::EtlError::from(($kind, $desc, $detail.to_string()))
    };
}

/// Returns early with an [`crate::error::EtlError`] built like [`etl_error!`].
#[macro_export]
macro_rules! bail {
    ($($arg:tt)+) => {
        return ::core::result::Result::Err($crate::etl_error!($($arg)+))
    };
}
