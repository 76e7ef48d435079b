use std::path::PathBuf;

/// Daemon configuration, loaded from `FACEPRINT_*` environment variables.
#[derive(Clone)]
pub struct Config {
    /// Listen address (default: 0.0.0.0:5000).
    pub bind: String,
    /// Directory containing the ONNX encoder model.
    pub model_dir: PathBuf,
    /// Qdrant base URL.
    pub qdrant_url: String,
    /// Qdrant collection holding the face points.
    pub qdrant_collection: String,
    /// Upper bound for the `top` search parameter.
    pub max_search_results: usize,
    /// Encoder batch size.
    pub batch_size: usize,
    /// Whether to run the horizontal-flip augmentation pass.
    pub flip_augment: bool,
    /// Side length of the aligned square crop fed to the encoder.
    pub image_size: u32,
    /// Fractional margin applied in bounding-box crop mode.
    pub margin: f32,
    /// Request body size limit in bytes.
    pub max_upload_bytes: usize,
}

impl Config {
    /// Load configuration from the environment with defaults.
    pub fn from_env() -> Self {
        let model_dir = std::env::var("FACEPRINT_MODEL_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("/app/models"));

        Self {
            bind: std::env::var("FACEPRINT_BIND").unwrap_or_else(|_| "0.0.0.0:5000".to_string()),
            model_dir,
            qdrant_url: std::env::var("FACEPRINT_QDRANT_URL")
                .unwrap_or_else(|_| "http://qdrant:6333".to_string()),
            qdrant_collection: std::env::var("FACEPRINT_QDRANT_COLLECTION")
                .unwrap_or_else(|_| "faces".to_string()),
            max_search_results: env_usize("FACEPRINT_MAX_SEARCH_RESULTS", 100),
            batch_size: env_usize("FACEPRINT_BATCH_SIZE", 1),
            flip_augment: env_flag("FACEPRINT_FLIP_AUGMENT", true),
            image_size: env_u32("FACEPRINT_IMAGE_SIZE", 112),
            margin: env_f32("FACEPRINT_MARGIN", 0.0),
            max_upload_bytes: env_usize("FACEPRINT_MAX_UPLOAD_BYTES", 16 * 1024 * 1024),
        }
    }

    /// Path to the ONNX face encoder model.
    pub fn encoder_model_path(&self) -> String {
        self.model_dir
            .join("face_encoder.onnx")
            .to_string_lossy()
            .into_owned()
    }
}

fn env_flag(key: &str, default: bool) -> bool {
    std::env::var(key)
        .map(|v| parse_flag(&v))
        .unwrap_or(default)
}

/// `0` and `false` (any case) disable a flag; everything else enables it.
fn parse_flag(value: &str) -> bool {
    !matches!(value.trim().to_ascii_lowercase().as_str(), "0" | "false")
}

fn env_f32(key: &str, default: f32) -> f32 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_u32(key: &str, default: u32) -> u32 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_usize(key: &str, default: usize) -> usize {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_flag_disabling_values() {
        assert!(!parse_flag("0"));
        assert!(!parse_flag("false"));
        assert!(!parse_flag("FALSE"));
        assert!(!parse_flag(" False "));
    }

    #[test]
    fn test_parse_flag_enabling_values() {
        assert!(parse_flag("1"));
        assert!(parse_flag("true"));
        assert!(parse_flag("yes"));
        assert!(parse_flag(""));
    }
}
