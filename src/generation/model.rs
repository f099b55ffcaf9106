//! The closed model table: every caller-facing model name this
//! gateway accepts, mapped to the upstream parameters it implies.

use crate::error::GatewayError;
use crate::upstream::Orientation;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Kind {
    Image,
    Video,
}

#[derive(Debug, Clone, Copy)]
pub struct ModelSpec {
    pub kind: Kind,
    pub width: u32,
    pub height: u32,
    pub orientation: Orientation,
    pub n_frames: u32,
}

pub fn parse_model(model: &str) -> Result<ModelSpec, GatewayError> {
    let spec = match model {
        "sora-image" | "sora-image-landscape" => ModelSpec {
            kind: Kind::Image,
            width: 1792,
            height: 1024,
            orientation: Orientation::Landscape,
            n_frames: 0,
        },
        "sora-image-portrait" => ModelSpec {
            kind: Kind::Image,
            width: 1024,
            height: 1792,
            orientation: Orientation::Portrait,
            n_frames: 0,
        },
        "sora-video-landscape-10s" => ModelSpec {
            kind: Kind::Video,
            width: 0,
            height: 0,
            orientation: Orientation::Landscape,
            n_frames: 300,
        },
        "sora-video-landscape-15s" => ModelSpec {
            kind: Kind::Video,
            width: 0,
            height: 0,
            orientation: Orientation::Landscape,
            n_frames: 450,
        },
        "sora-video-portrait-10s" => ModelSpec {
            kind: Kind::Video,
            width: 0,
            height: 0,
            orientation: Orientation::Portrait,
            n_frames: 300,
        },
        "sora-video-portrait-15s" => ModelSpec {
            kind: Kind::Video,
            width: 0,
            height: 0,
            orientation: Orientation::Portrait,
            n_frames: 450,
        },
        other => return Err(GatewayError::InvalidModel(other.to_string())),
    };
    Ok(spec)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recognizes_every_closed_set_member() {
        for name in [
            "sora-image",
            "sora-image-landscape",
            "sora-image-portrait",
            "sora-video-landscape-10s",
            "sora-video-landscape-15s",
            "sora-video-portrait-10s",
            "sora-video-portrait-15s",
        ] {
            assert!(parse_model(name).is_ok(), "{name} should be recognized");
        }
    }

    #[test]
    fn video_frame_counts_match_duration() {
        assert_eq!(parse_model("sora-video-landscape-10s").unwrap().n_frames, 300);
        assert_eq!(parse_model("sora-video-landscape-15s").unwrap().n_frames, 450);
    }

    #[test]
    fn rejects_unknown_model() {
        let err = parse_model("gpt-4o").unwrap_err();
        assert_eq!(err.kind(), "invalid_model");
    }
}
