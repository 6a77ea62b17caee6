//! Internal helper macros.

/// Returns early with `$error` unless `$predicate` holds.
///
/// Like `assert!`, but for validation that should fail with an error instead
/// of panicking:
///
/// ```ignore
/// ensure!(self.consumed <= self.max_size, ParseError::too_large_header(self.consumed, self.max_size));
/// ```
macro_rules! ensure {
    ($predicate:expr, $error:expr) => {
        if !$predicate {
            return Err($error);
        }
    };
}

pub(crate) use ensure;
