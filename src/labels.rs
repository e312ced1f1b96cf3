//! Class-index to label tables. Index order matches the network's output
//! layout and must not be reordered.

pub const RACE_LABELS: [&str; 5] = ["white", "black", "asian", "indian", "others"];

pub const GENDER_LABELS: [&str; 2] = ["male", "female"];

pub fn race_label(index: usize) -> Option<&'static str> {
    RACE_LABELS.get(index).copied()
}

pub fn gender_label(index: usize) -> Option<&'static str> {
    GENDER_LABELS.get(index).copied()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lookups_follow_table_order() {
        assert_eq!(race_label(0), Some("white"));
        assert_eq!(race_label(2), Some("asian"));
        assert_eq!(race_label(4), Some("others"));
        assert_eq!(gender_label(0), Some("male"));
        assert_eq!(gender_label(1), Some("female"));
    }

    #[test]
    fn out_of_range_index_has_no_label() {
        assert_eq!(race_label(RACE_LABELS.len()), None);
        assert_eq!(gender_label(2), None);
    }
}
