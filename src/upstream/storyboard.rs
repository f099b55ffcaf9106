//! Storyboard prompt detection/formatting and remix-prompt cleanup.

use regex::Regex;
use std::sync::OnceLock;

fn shot_tag_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\[(\d+(?:\.\d+)?)s\]").unwrap())
}

fn share_link_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"https?://[^\s]+/p/s_[0-9a-fA-F]{32}").unwrap())
}

fn bare_share_id_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"s_[0-9a-fA-F]{32}").unwrap())
}

fn whitespace_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\s+").unwrap())
}

/// True if the prompt carries at least one `[N(.M)?s]` shot-duration tag.
pub fn is_storyboard(prompt: &str) -> bool {
    shot_tag_re().is_match(prompt)
}

/// Reformat a storyboard prompt into the `current timeline:\nShot i:\nduration:
/// …sec\nScene: …` blockset the storyboard endpoint expects, with a trailing
/// `instructions:` block carrying any text that precedes the first tag.
pub fn format_storyboard(prompt: &str) -> String {
    let re = shot_tag_re();
    let matches: Vec<_> = re.find_iter(prompt).collect();
    if matches.is_empty() {
        return prompt.to_string();
    }

    let preamble = prompt[..matches[0].start()].trim();

    let mut out = String::from("current timeline:\n");
    for (shot_index, m) in matches.iter().enumerate() {
        let duration = &prompt[m.start() + 1..m.end() - 2]; // strip "[" and "s]"
        let scene_start = m.end();
        let scene_end = matches
            .get(shot_index + 1)
            .map(|next| next.start())
            .unwrap_or(prompt.len());
        let scene = prompt[scene_start..scene_end].trim();

        if shot_index > 0 {
            out.push_str("\n\n");
        }
        out.push_str(&format!(
            "Shot {}:\nduration: {}sec\nScene: {}",
            shot_index + 1,
            duration,
            scene
        ));
    }

    if !preamble.is_empty() {
        out.push_str("\n\ninstructions:\n");
        out.push_str(preamble);
    }

    out
}

/// Pull the first `s_<32 hex>` share id out of a prompt, whether it appears
/// bare or embedded in a share link, for the caller-facing endpoint to route
/// a remix request without a separate out-of-band field.
pub fn extract_share_id(prompt: &str) -> Option<String> {
    bare_share_id_re().find(prompt).map(|m| m.as_str().to_string())
}

/// Strip share-link/share-id remnants from a remix prompt and collapse
/// repeated whitespace.
pub fn clean_remix_prompt(prompt: &str) -> String {
    let stripped = share_link_re().replace_all(prompt, "");
    let stripped = bare_share_id_re().replace_all(&stripped, "");
    whitespace_re().replace_all(stripped.trim(), " ").to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detects_storyboard_tags() {
        assert!(is_storyboard("[5s] a sunrise"));
        assert!(is_storyboard("intro [3.5s] scene one"));
        assert!(!is_storyboard("a plain prompt with no tags"));
    }

    #[test]
    fn formats_shots_with_trailing_instructions() {
        let prompt = "Cat movie\n[5.0s]jumps [3.0s]lands";
        let formatted = format_storyboard(prompt);
        assert_eq!(
            formatted,
            "current timeline:\nShot 1:\nduration: 5.0sec\nScene: jumps\n\nShot 2:\nduration: 3.0sec\nScene: lands\n\ninstructions:\nCat movie"
        );
    }

    #[test]
    fn formats_without_preamble() {
        let prompt = "[10s] a single long shot";
        let formatted = format_storyboard(prompt);
        assert!(!formatted.contains("instructions:"));
        assert_eq!(formatted, "current timeline:\nShot 1:\nduration: 10sec\nScene: a single long shot");
    }

    #[test]
    fn extracts_share_id_from_link_or_bare_form() {
        let linked = "remix this https://sora.chatgpt.com/p/s_0123456789abcdef0123456789abcdef please";
        assert_eq!(extract_share_id(linked).as_deref(), Some("s_0123456789abcdef0123456789abcdef"));

        let bare = "based on s_fedcba9876543210fedcba9876543210 make it longer";
        assert_eq!(extract_share_id(bare).as_deref(), Some("s_fedcba9876543210fedcba9876543210"));

        assert!(extract_share_id("no share id here").is_none());
    }

    #[test]
    fn cleans_share_links_and_bare_ids() {
        let prompt = "remix this https://sora.chatgpt.com/p/s_0123456789abcdef0123456789abcdef please";
        let cleaned = clean_remix_prompt(prompt);
        assert_eq!(cleaned, "remix this please");

        let bare = "based on s_fedcba9876543210fedcba9876543210 make it longer";
        assert_eq!(clean_remix_prompt(bare), "based on make it longer");
    }
}
