use std::collections::hash_map::RandomState;
use std::hash::{BuildHasher, Hasher};
use std::time::{SystemTime, UNIX_EPOCH};

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};

/// Lovingly borrowed from the cargo crate
///
/// Joins an iterator of [std::fmt::Display]'ables into an output writable
pub(crate) fn iter_join_onto<W, I, T>(mut w: W, iter: I, delim: &str) -> std::fmt::Result
where
    W: std::fmt::Write,
    I: IntoIterator<Item = T>,
    T: std::fmt::Display,
{
    let mut it = iter.into_iter().peekable();
    while let Some(n) = it.next() {
        write!(w, "{}", n)?;
        if it.peek().is_some() {
            write!(w, "{}", delim)?;
        }
    }
    Ok(())
}

/// Lovingly borrowed from the cargo crate
///
/// Joins an iterator of [std::fmt::Display]'ables to a new [std::string::String].
pub(crate) fn iter_join<I, T>(iter: I, delim: &str) -> String
where
    I: IntoIterator<Item = T>,
    T: std::fmt::Display,
{
    let mut s = String::new();
    let _ = iter_join_onto(&mut s, iter, delim);
    s
}

/// A mailbox name which is very unlikely to exist on any server.
///
/// Used to leave the selected state on servers without `UNSELECT`: `EXAMINE`-ing a mailbox that
/// is not there drops the current selection without expunging anything.
pub(crate) fn random_mailbox_name() -> String {
    let mut hasher = RandomState::new().build_hasher();
    if let Ok(now) = SystemTime::now().duration_since(UNIX_EPOCH) {
        hasher.write_u128(now.as_nanos());
    }
    let a = hasher.finish();
    hasher.write_u64(a);
    let b = hasher.finish();

    let mut raw = Vec::with_capacity(16);
    raw.extend_from_slice(&a.to_be_bytes());
    raw.extend_from_slice(&b.to_be_bytes());
    format!("imap-engine-nonexistent-{}", URL_SAFE_NO_PAD.encode(raw))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn join() {
        assert_eq!(iter_join(vec![1, 2, 3], ","), "1,2,3");
        assert_eq!(iter_join(Vec::<u32>::new(), ","), "");
    }

    #[test]
    fn random_names_differ() {
        let a = random_mailbox_name();
        let b = random_mailbox_name();
        assert_ne!(a, b);
        assert!(a.starts_with("imap-engine-nonexistent-"));
        assert!(!a.contains('/'));
    }
}
