//! RFC 7233 byte-range parsing.
//!
//! A faithful single-range subset: suffix ranges (`-N`), open ranges
//! (`N-`) and bounded ranges (`N-M`). Multi-range requests are parsed
//! but served as their first range only; no multipart responses.

use crate::error::{ServerError, ServerResult};

/// A byte range to be sent to the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HttpRange {
    pub start: u64,
    pub length: u64,
}

impl HttpRange {
    /// Renders the `Content-Range` header value for a 206 response.
    pub fn content_range(&self, size: u64) -> String {
        format!("bytes {}-{}/{}", self.start, self.start + self.length - 1, size)
    }
}

/// Parses a `Range` header against a representation of `size` bytes.
///
/// Returns `Ok(vec![])` when the header is absent.
/// [`ServerError::RangeUnsatisfiable`] is returned when the first byte
/// position of every spec is past the end of the representation.
pub fn parse_range(header: Option<&str>, size: u64) -> ServerResult<Vec<HttpRange>> {
    let header = match header {
        None | Some("") => return Ok(vec![]),
        Some(header) => header,
    };

    let spec = header
        .strip_prefix("bytes=")
        .ok_or(ServerError::RangeInvalid)?;

    let mut ranges = Vec::new();
    let mut no_overlap = false;

    for part in spec.split(',') {
        let part = part.trim();
        if part.is_empty() {
            continue;
        }

        let dash = part.find('-').ok_or(ServerError::RangeInvalid)?;
        let (start, end) = (part[..dash].trim(), part[dash + 1..].trim());

        let range = if start.is_empty() {
            // Suffix range: the last N bytes
            let mut n: u64 = end.parse().map_err(|_| ServerError::RangeInvalid)?;
            if n > size {
                n = size;
            }
            HttpRange {
                start: size - n,
                length: n,
            }
        } else {
            let start: u64 = start.parse().map_err(|_| ServerError::RangeInvalid)?;
            if start >= size {
                // Begins past the end of the content
                no_overlap = true;
                continue;
            }

            let length = if end.is_empty() {
                size - start
            } else {
                let mut end: u64 = end.parse().map_err(|_| ServerError::RangeInvalid)?;
                if start > end {
                    return Err(ServerError::RangeInvalid);
                }
                if end >= size {
                    end = size - 1;
                }
                end - start + 1
            };

            HttpRange { start, length }
        };

        ranges.push(range);
    }

    if no_overlap && ranges.is_empty() {
        return Err(ServerError::RangeUnsatisfiable { size });
    }

    Ok(ranges)
}

/// Total number of bytes the parsed ranges cover.
pub fn sum_ranges_size(ranges: &[HttpRange]) -> u64 {
    ranges.iter().map(|r| r.length).sum()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_no_header() {
        assert!(parse_range(None, 100).unwrap().is_empty());
        assert!(parse_range(Some(""), 100).unwrap().is_empty());
    }

    #[test]
    fn test_bounded_range() {
        let ranges = parse_range(Some("bytes=0-99"), 1000).unwrap();
        assert_eq!(ranges, vec![HttpRange { start: 0, length: 100 }]);

        let ranges = parse_range(Some("bytes=4000000-4000104"), 158_433_824).unwrap();
        assert_eq!(
            ranges,
            vec![HttpRange {
                start: 4_000_000,
                length: 105
            }]
        );
        assert_eq!(
            ranges[0].content_range(158_433_824),
            "bytes 4000000-4000104/158433824"
        );
    }

    #[test]
    fn test_open_range() {
        let ranges = parse_range(Some("bytes=500-"), 1000).unwrap();
        assert_eq!(ranges, vec![HttpRange { start: 500, length: 500 }]);
    }

    #[test]
    fn test_suffix_range() {
        let ranges = parse_range(Some("bytes=-200"), 1000).unwrap();
        assert_eq!(ranges, vec![HttpRange { start: 800, length: 200 }]);

        // Suffix longer than the representation covers all of it
        let ranges = parse_range(Some("bytes=-5000"), 1000).unwrap();
        assert_eq!(ranges, vec![HttpRange { start: 0, length: 1000 }]);
    }

    #[test]
    fn test_end_clamped_to_size() {
        let ranges = parse_range(Some("bytes=900-5000"), 1000).unwrap();
        assert_eq!(ranges, vec![HttpRange { start: 900, length: 100 }]);
    }

    #[test]
    fn test_no_overlap() {
        let err = parse_range(Some("bytes=999999999-"), 128_791_189).unwrap_err();
        match err {
            ServerError::RangeUnsatisfiable { size } => assert_eq!(size, 128_791_189),
            e => panic!("wrong error: {e:?}"),
        }
    }

    #[test]
    fn test_invalid_ranges() {
        for bad in ["bits=0-100", "bytes=abc-", "bytes=100", "bytes=50-10"] {
            assert!(parse_range(Some(bad), 1000).is_err(), "{bad} parsed");
        }
    }

    #[test]
    fn test_multi_range_parses() {
        let ranges = parse_range(Some("bytes=0-0, 500-599"), 1000).unwrap();
        assert_eq!(ranges.len(), 2);
        assert_eq!(sum_ranges_size(&ranges), 101);
    }
}
