//! Byte-range grammar for the streaming endpoint.

/// Why a range header could not be honoured.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RangeError {
    /// The header did not follow `bytes=a-b` (multipart ranges included).
    Malformed,
    /// The range lies entirely past the end of the resource.
    Unsatisfiable,
}

/// Resolve a `Range` header against a resource of `size` bytes.
///
/// Returns the inclusive `(start, end)` span to serve, or `None` when no
/// usable span exists for an empty resource suffix request.
///
/// - `bytes=a-` serves `[a, size-1]`.
/// - `bytes=-n` serves the last `n` bytes.
/// - `bytes=a-b` serves `[a, min(b, size-1)]`.
/// - `a >= size` is unsatisfiable.
///
/// # Errors
///
/// [`RangeError::Malformed`] for syntax errors, [`RangeError::Unsatisfiable`]
/// for ranges past the end of the resource.
pub fn resolve_range(header: &str, size: u64) -> Result<(u64, u64), RangeError> {
    let spec = header.strip_prefix("bytes=").ok_or(RangeError::Malformed)?;
    if spec.contains(',') {
        // multipart ranges are deliberately unsupported
        return Err(RangeError::Malformed);
    }
    let (start_raw, end_raw) = spec.split_once('-').ok_or(RangeError::Malformed)?;

    match (start_raw.is_empty(), end_raw.is_empty()) {
        (true, true) => Err(RangeError::Malformed),
        // suffix: the last n bytes
        (true, false) => {
            let count: u64 = end_raw.parse().map_err(|_| RangeError::Malformed)?;
            if count == 0 || size == 0 {
                return Err(RangeError::Unsatisfiable);
            }
            Ok((size.saturating_sub(count), size - 1))
        }
        // open-ended: from a to the last byte
        (false, true) => {
            let start: u64 = start_raw.parse().map_err(|_| RangeError::Malformed)?;
            if start >= size {
                return Err(RangeError::Unsatisfiable);
            }
            Ok((start, size - 1))
        }
        (false, false) => {
            let start: u64 = start_raw.parse().map_err(|_| RangeError::Malformed)?;
            let end: u64 = end_raw.parse().map_err(|_| RangeError::Malformed)?;
            if start > end {
                return Err(RangeError::Malformed);
            }
            if start >= size {
                return Err(RangeError::Unsatisfiable);
            }
            Ok((start, end.min(size - 1)))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bounded_ranges_clamp_to_the_resource() {
        assert_eq!(resolve_range("bytes=100-199", 1_000), Ok((100, 199)));
        assert_eq!(resolve_range("bytes=0-0", 1_000), Ok((0, 0)));
        assert_eq!(resolve_range("bytes=900-2000", 1_000), Ok((900, 999)));
    }

    #[test]
    fn open_ended_ranges_run_to_the_last_byte() {
        assert_eq!(resolve_range("bytes=950-", 1_000), Ok((950, 999)));
        assert_eq!(resolve_range("bytes=0-", 1_000), Ok((0, 999)));
    }

    #[test]
    fn suffix_ranges_serve_the_tail() {
        assert_eq!(resolve_range("bytes=-50", 1_000), Ok((950, 999)));
        assert_eq!(resolve_range("bytes=-2000", 1_000), Ok((0, 999)));
    }

    #[test]
    fn past_the_end_is_unsatisfiable() {
        assert_eq!(
            resolve_range("bytes=1000-", 1_000),
            Err(RangeError::Unsatisfiable)
        );
        assert_eq!(
            resolve_range("bytes=2000-2100", 1_000),
            Err(RangeError::Unsatisfiable)
        );
        assert_eq!(resolve_range("bytes=0-", 0), Err(RangeError::Unsatisfiable));
    }

    #[test]
    fn malformed_headers_are_rejected() {
        for header in [
            "bites=0-1",
            "bytes=",
            "bytes=-",
            "bytes=a-b",
            "bytes=5-1",
            "bytes=0-1,5-6",
        ] {
            assert_eq!(
                resolve_range(header, 1_000),
                Err(RangeError::Malformed),
                "{header} should be malformed"
            );
        }
    }
}
