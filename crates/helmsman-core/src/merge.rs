//! Override-merge for desired state fragments
//!
//! Rules, applied field by field when a later file is merged over an earlier one:
//! - Strings: a non-empty overlay replaces the base
//! - Options: `Some` replaces the base, `None` leaves it untouched (tri-state booleans)
//! - Maps: recursive merge, key by key
//! - Sequences: a non-empty overlay replaces the base (never appended)

use std::collections::BTreeMap;

/// Merge an overlay into `self`, consuming the overlay
pub trait Merge {
    fn merge(&mut self, overlay: Self);
}

impl Merge for String {
    fn merge(&mut self, overlay: Self) {
        if !overlay.is_empty() {
            *self = overlay;
        }
    }
}

impl<T> Merge for Option<T> {
    fn merge(&mut self, overlay: Self) {
        if overlay.is_some() {
            *self = overlay;
        }
    }
}

impl<T> Merge for Vec<T> {
    fn merge(&mut self, overlay: Self) {
        if !overlay.is_empty() {
            *self = overlay;
        }
    }
}

impl<V: Merge> Merge for BTreeMap<String, V> {
    fn merge(&mut self, overlay: Self) {
        for (key, value) in overlay {
            match self.get_mut(&key) {
                Some(existing) => existing.merge(value),
                None => {
                    self.insert(key, value);
                }
            }
        }
    }
}

/// Implement [`Merge`] for a struct by merging each listed field
#[macro_export]
macro_rules! merge_fields {
    ($ty:ty { $($field:ident),* $(,)? }) => {
        impl $crate::merge::Merge for $ty {
            fn merge(&mut self, overlay: Self) {
                $( $crate::merge::Merge::merge(&mut self.$field, overlay.$field); )*
            }
        }
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_option_does_not_clobber() {
        let mut base = Some(true);
        base.merge(None);
        assert_eq!(base, Some(true));

        base.merge(Some(false));
        assert_eq!(base, Some(false));
    }

    #[test]
    fn test_string_empty_keeps_base() {
        let mut base = "stable/jenkins".to_string();
        base.merge(String::new());
        assert_eq!(base, "stable/jenkins");
    }

    #[test]
    fn test_vec_replaced_not_appended() {
        let mut base = vec!["a.yaml".to_string(), "b.yaml".to_string()];
        base.merge(vec!["c.yaml".to_string()]);
        assert_eq!(base, vec!["c.yaml".to_string()]);
    }

    #[test]
    fn test_map_deep_merge() {
        let mut base: BTreeMap<String, String> =
            [("a".to_string(), "1".to_string()), ("b".to_string(), "2".to_string())].into();
        let overlay: BTreeMap<String, String> =
            [("b".to_string(), "3".to_string()), ("c".to_string(), "4".to_string())].into();
        base.merge(overlay);

        assert_eq!(base["a"], "1");
        assert_eq!(base["b"], "3");
        assert_eq!(base["c"], "4");
    }
}
