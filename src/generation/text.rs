//! Small text-shaping helpers for the character-creation branch.

use rand::Rng;

/// Derive a display username from the upstream's `username_hint`: the
/// substring after the final `.` (if any), with three random digits appended.
pub fn derive_username(username_hint: &str) -> String {
    let base = username_hint.rsplit('.').next().unwrap_or(username_hint);
    let mut rng = rand::thread_rng();
    let suffix: u32 = rng.gen_range(100..=999);
    format!("{base}{suffix}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn takes_substring_after_final_dot() {
        let name = derive_username("project_y.characters.aria");
        assert!(name.starts_with("aria"));
        assert_eq!(name.len(), "aria".len() + 3);
    }

    #[test]
    fn falls_back_to_whole_hint_when_no_dot() {
        let name = derive_username("aria");
        assert!(name.starts_with("aria"));
    }
}
