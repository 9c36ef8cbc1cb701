//! Media types.

/// Normalises content types that browsers refuse to play natively.
pub fn patch_media_type(media_type: &str) -> &str {
    match media_type {
        "video/m4v" | "video/webm" => "video/mp4",
        _ => media_type,
    }
}

/// Guesses a file extension for a content type.
///
/// Used when a stream lacks a suggested file name and one has to be
/// synthesized from the claim name.
pub fn extension_for(media_type: &str) -> Option<&'static str> {
    let ext = match media_type {
        "video/mp4" | "video/m4v" => ".mp4",
        "video/webm" => ".webm",
        "video/quicktime" => ".mov",
        "audio/mpeg" | "audio/mp3" => ".mp3",
        "audio/mp4" => ".m4a",
        "audio/ogg" => ".ogg",
        "audio/wav" => ".wav",
        "image/jpeg" => ".jpg",
        "image/png" => ".png",
        "image/gif" => ".gif",
        "application/pdf" => ".pdf",
        "text/markdown" => ".md",
        _ => return None,
    };

    Some(ext)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_patch_media_type() {
        assert_eq!(patch_media_type("video/m4v"), "video/mp4");
        assert_eq!(patch_media_type("video/webm"), "video/mp4");
        assert_eq!(patch_media_type("audio/mpeg"), "audio/mpeg");
    }

    #[test]
    fn test_extension_for() {
        assert_eq!(extension_for("video/mp4"), Some(".mp4"));
        assert_eq!(extension_for("application/x-unknown"), None);
    }
}
