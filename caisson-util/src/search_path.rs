//! Colon-separated search path lists.

use std::ffi::{OsStr, OsString};

/// Builder for a colon-separated search path list,
/// as used by `LD_LIBRARY_PATH`, `LIBGL_DRIVERS_PATH`, and friends.
///
/// Empty entries are skipped rather than
/// producing a stray `::` in the output.
#[derive(Debug, Default)]
pub struct SearchPath
{
    inner: OsString,
}

impl SearchPath
{
    /// Create an empty search path.
    pub fn new() -> Self
    {
        Self::default()
    }

    /// Append an entry, inserting `:` if the list is non-empty.
    pub fn append(&mut self, entry: impl AsRef<OsStr>)
    {
        let entry = entry.as_ref();

        if entry.is_empty() {
            return;
        }

        if !self.inner.is_empty() {
            self.inner.push(":");
        }

        self.inner.push(entry);
    }

    /// Whether no entries have been appended.
    pub fn is_empty(&self) -> bool
    {
        self.inner.is_empty()
    }

    /// View the assembled list.
    pub fn as_os_str(&self) -> &OsStr
    {
        &self.inner
    }

    /// Return the assembled list.
    pub fn into_os_string(self) -> OsString
    {
        self.inner
    }
}

#[cfg(test)]
mod tests
{
    use super::*;

    #[test]
    fn append()
    {
        let mut path = SearchPath::new();
        assert!(path.is_empty());

        path.append("/overrides/lib/x86_64-linux-gnu");
        path.append("");
        path.append("/overrides/lib/i386-linux-gnu");

        assert!(!path.is_empty());
        assert_eq!(
            path.as_os_str(),
            OsStr::new("/overrides/lib/x86_64-linux-gnu\
                        :/overrides/lib/i386-linux-gnu"),
        );
    }
}
