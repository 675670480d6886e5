use std::fmt;

use super::Uid;

/// An IMAP [sequence set](https://tools.ietf.org/html/rfc3501#section-9) over UIDs or sequence
/// numbers.
///
/// Built from an arbitrary list of numbers, which is sorted, deduplicated and collapsed into
/// ranges, or as an open-ended `N:*` range.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Sequence {
    ranges: Vec<(u32, u32)>,
    open_from: Option<u32>,
}

impl Sequence {
    /// Build a sequence covering exactly the given numbers.
    ///
    /// Returns `None` when `numbers` is empty, since IMAP has no syntax for an empty set.
    pub fn from_list<I: IntoIterator<Item = u32>>(numbers: I) -> Option<Self> {
        let mut numbers: Vec<u32> = numbers.into_iter().collect();
        if numbers.is_empty() {
            return None;
        }
        numbers.sort_unstable();
        numbers.dedup();

        let mut ranges: Vec<(u32, u32)> = Vec::new();
        for n in numbers {
            match ranges.last_mut() {
                Some((_, hi)) if *hi + 1 == n => *hi = n,
                _ => ranges.push((n, n)),
            }
        }
        Some(Sequence {
            ranges,
            open_from: None,
        })
    }

    /// The `lo:hi` range.
    pub fn range(lo: u32, hi: u32) -> Self {
        Sequence {
            ranges: vec![(lo.min(hi), lo.max(hi))],
            open_from: None,
        }
    }

    /// The open-ended `start:*` range.
    pub fn starting_at(start: Uid) -> Self {
        Sequence {
            ranges: Vec::new(),
            open_from: Some(start),
        }
    }

    /// Number of items covered, or `None` for an open-ended sequence.
    pub fn len(&self) -> Option<usize> {
        if self.open_from.is_some() {
            return None;
        }
        Some(
            self.ranges
                .iter()
                .map(|(lo, hi)| (hi - lo) as usize + 1)
                .sum(),
        )
    }

    /// Whether this sequence covers nothing.
    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty() && self.open_from.is_none()
    }
}

impl fmt::Display for Sequence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts = self
            .ranges
            .iter()
            .map(|&(lo, hi)| {
                if lo == hi {
                    lo.to_string()
                } else {
                    format!("{}:{}", lo, hi)
                }
            })
            .chain(self.open_from.map(|start| format!("{}:*", start)));
        f.write_str(&crate::utils::iter_join(parts, ","))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn collapses_consecutive_numbers() {
        let seq = Sequence::from_list(vec![7, 1, 2, 3, 5, 8, 9, 3]).unwrap();
        assert_eq!(seq.to_string(), "1:3,5,7:9");
        assert_eq!(seq.len(), Some(7));
    }

    #[test]
    fn empty_list_has_no_sequence() {
        assert_eq!(Sequence::from_list(Vec::new()), None);
    }

    #[test]
    fn open_ended() {
        let seq = Sequence::starting_at(11);
        assert_eq!(seq.to_string(), "11:*");
        assert_eq!(seq.len(), None);
        assert_eq!(Sequence::range(1, 10).to_string(), "1:10");
    }
}
