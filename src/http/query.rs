//! Query string splitter with pluggable collectors.

use memchr::memchr;
use std::collections::HashMap;

/// Splits `key=value&...` strings without decoding them.
///
/// A leading `?` is skipped. Pairs without `=` get an empty value, and
/// empty segments are kept as empty pairs. Decoding is left to the
/// collector; [`Url`](crate::Url) plugs in a percent-decoding one.
///
/// ```rust
/// use wicket::query::Query;
///
/// let pairs: Vec<(&[u8], &[u8])> = Query::parse(b"?debug&name=&=x&&", 8).unwrap();
///
/// assert_eq!(pairs.len(), 4);
/// assert!(pairs[0] == (b"debug", b""));
/// assert!(pairs[1] == (b"name", b""));
/// assert!(pairs[2] == (b"", b"x"));
/// assert!(pairs[3] == (b"", b""));
/// ```
pub struct Query;

impl Query {
    /// Parses into a fresh collection. Fails with [`Error::OverLimit`] once
    /// more than `limit` pairs are seen.
    #[inline(always)]
    pub fn parse<'a, C: QueryCollector<'a>>(query: &'a [u8], limit: usize) -> Result<C, Error> {
        let mut result = C::with_capacity(limit.min(16));
        Self::parse_into(&mut result, query, limit)?;
        Ok(result)
    }

    /// Appends the pairs of `query` to an existing collection.
    #[inline]
    pub fn parse_into<'a, C: QueryCollector<'a>>(
        result: &mut C,
        query: &'a [u8],
        limit: usize,
    ) -> Result<(), Error> {
        let data = match query.first().ok_or(Error::Empty)? {
            b'?' => &query[1..],
            _ => query,
        };

        let mut start = 0;
        while start < data.len() {
            if result.length() >= limit {
                return Err(Error::OverLimit(limit));
            }

            let end = memchr(b'&', &data[start..])
                .map(|pos| start + pos)
                .unwrap_or(data.len());
            let split = start + memchr(b'=', &data[start..end]).unwrap_or(end - start);

            let value: &[u8] = match split < end {
                true => &data[split + 1..end],
                false => b"",
            };

            result.add_param(&data[start..split], value);
            start = end + 1;
        }

        Ok(())
    }
}

/// Storage for parsed query pairs.
pub trait QueryCollector<'a>
where
    Self: Sized,
{
    /// Adds one pair.
    fn add_param(&mut self, key: &'a [u8], value: &'a [u8]);

    /// Pairs collected so far.
    fn length(&self) -> usize;

    fn with_capacity(capacity: usize) -> Self;
}

// Order preserving.
impl<'a> QueryCollector<'a> for Vec<(&'a [u8], &'a [u8])> {
    #[inline(always)]
    fn add_param(&mut self, key: &'a [u8], value: &'a [u8]) {
        self.push((key, value));
    }

    #[inline(always)]
    fn length(&self) -> usize {
        self.len()
    }

    #[inline(always)]
    fn with_capacity(capacity: usize) -> Self {
        Vec::with_capacity(capacity)
    }
}

// Last value wins.
impl<'a> QueryCollector<'a> for HashMap<&'a [u8], &'a [u8]> {
    #[inline(always)]
    fn add_param(&mut self, key: &'a [u8], value: &'a [u8]) {
        self.insert(key, value);
    }

    #[inline(always)]
    fn length(&self) -> usize {
        self.len()
    }

    #[inline(always)]
    fn with_capacity(capacity: usize) -> Self {
        HashMap::with_capacity(capacity)
    }
}

/// Query parsing failures.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Error {
    /// More pairs than the configured limit.
    #[error("query parameter limit exceeded: limit={0}")]
    OverLimit(usize),

    /// Nothing to parse.
    #[error("query string is empty")]
    Empty,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tools::*;

    #[test]
    fn basic() {
        for line in ["a=1&b=2", "?a=1&b=2"] {
            let params: Vec<(&[u8], &[u8])> = Query::parse(line.as_bytes(), 8).unwrap();

            assert_eq!(params.len(), 2);
            assert_eq!(str_2(params[0]), ("a", "1"));
            assert_eq!(str_2(params[1]), ("b", "2"));
        }
    }

    #[test]
    fn odd_segments() {
        let params: Vec<(&[u8], &[u8])> = Query::parse(b"flag&empty=&=val&&key=a=b", 10).unwrap();

        assert_eq!(params.len(), 5);
        assert_eq!(str_2(params[0]), ("flag", ""));
        assert_eq!(str_2(params[1]), ("empty", ""));
        assert_eq!(str_2(params[2]), ("", "val"));
        assert_eq!(str_2(params[3]), ("", ""));
        assert_eq!(str_2(params[4]), ("key", "a=b"));
    }

    #[test]
    fn hashmap_dedup() {
        let params: HashMap<&[u8], &[u8]> = Query::parse(b"k=1&k=2", 10).unwrap();
        assert_eq!(params.len(), 1);
        assert_eq!(params[&b"k"[..]], b"2");
    }

    #[test]
    fn errors() {
        assert_eq!(
            Query::parse::<Vec<(&[u8], &[u8])>>(b"a&a", 1),
            Err(Error::OverLimit(1))
        );
        assert_eq!(
            Query::parse::<Vec<(&[u8], &[u8])>>(b"", 10),
            Err(Error::Empty)
        );
    }
}
