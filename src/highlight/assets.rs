//! Static asset classification by path extension.

const IMAGES: &[&str] = &[".png", ".jpg", ".jpeg", ".gif", ".svg", ".ico"];
const SCRIPTS: &[&str] = &[".js", ".mjs", ".css", ".map"];
const FONTS_MEDIA: &[&str] = &[".woff", ".woff2", ".ttf", ".eot", ".mp4", ".webm", ".ogg", ".mp3"];

/// Which asset groups count as static.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StaticGroups {
    pub images: bool,
    pub scripts: bool,
    pub fonts_media: bool,
}

impl StaticGroups {
    pub fn all() -> Self {
        Self {
            images: true,
            scripts: true,
            fonts_media: true,
        }
    }
}

/// True if `path` (query already stripped) ends in an enabled asset extension.
/// Comparison is case-insensitive.
pub fn is_static(path: &str, groups: &StaticGroups) -> bool {
    let path = path.to_ascii_lowercase();
    let ends_with_any = |exts: &[&str]| exts.iter().any(|ext| path.ends_with(ext));

    (groups.images && ends_with_any(IMAGES))
        || (groups.scripts && ends_with_any(SCRIPTS))
        || (groups.fonts_media && ends_with_any(FONTS_MEDIA))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_groups_toggle_independently() {
        let only_images = StaticGroups {
            images: true,
            scripts: false,
            fonts_media: false,
        };
        assert!(is_static("/img/Logo.PNG", &only_images));
        assert!(!is_static("/app.js", &only_images));
        assert!(is_static("/app.js", &StaticGroups::all()));
        assert!(is_static("/fonts/a.woff2", &StaticGroups::all()));
        assert!(!is_static("/api/users", &StaticGroups::all()));
        assert!(!is_static("/data.json", &StaticGroups::all()));
    }
}
