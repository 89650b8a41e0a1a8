//! Recognises macOS installer application bundles.

use std::path::Path;

const VERSION_PLIST: &str = "Contents/version.plist";
/// Disk images that carry the installer payload; older installers ship
/// InstallESD.dmg, newer ones SharedSupport.dmg.
const PAYLOADS: [&str; 2] = [
    "Contents/SharedSupport/InstallESD.dmg",
    "Contents/SharedSupport/SharedSupport.dmg",
];

pub fn is_valid_installer(path: &Path) -> bool {
    path.join(VERSION_PLIST).is_file() && PAYLOADS.iter().any(|p| path.join(p).is_file())
}

/// Name shown in titles, e.g. `Install macOS Mojave.app`.
pub fn display_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_bundle(root: &Path, payload: &str) -> std::path::PathBuf {
        let app = root.join("Install macOS Test.app");
        std::fs::create_dir_all(app.join("Contents/SharedSupport")).unwrap();
        std::fs::write(app.join(VERSION_PLIST), "<plist/>").unwrap();
        std::fs::write(app.join(payload), b"").unwrap();
        app
    }

    #[test]
    fn accepts_either_payload_image() {
        let dir = tempfile::tempdir().unwrap();
        let app = make_bundle(dir.path(), PAYLOADS[0]);
        assert!(is_valid_installer(&app));

        let dir = tempfile::tempdir().unwrap();
        let app = make_bundle(dir.path(), PAYLOADS[1]);
        assert!(is_valid_installer(&app));
        assert_eq!(display_name(&app), "Install macOS Test.app");
    }

    #[test]
    fn rejects_bundle_without_payload() {
        let dir = tempfile::tempdir().unwrap();
        let app = dir.path().join("Broken.app");
        std::fs::create_dir_all(app.join("Contents")).unwrap();
        std::fs::write(app.join(VERSION_PLIST), "<plist/>").unwrap();
        assert!(!is_valid_installer(&app));
        assert!(!is_valid_installer(&dir.path().join("missing.app")));
    }
}
