//! ATOC image manifest
//!
//! The manifest is the JSON config consumed by `app-gen-toc`. Only the
//! image entries matter here:
//!
//! ```json
//! {
//!   "TFA":    { "binary": "bl32.bin",   "mramAddress": "0x80002000" },
//!   "DTB":    { "binary": "devkit.dtb", "mramAddress": "0x80010000" },
//!   "KERNEL": { "binary": "xipImage",   "mramAddress": "0x80020000" },
//!   "ROOTFS": { "binary": "cramfs",     "mramAddress": "0x80380000", "disabled": true }
//! }
//! ```

use serde::Deserialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Command;
use thiserror::Error;

/// Image keys, in flashing order
pub const IMAGE_KEYS: [&str; 4] = ["TFA", "DTB", "KERNEL", "ROOTFS"];

/// Name of the TOC generator inside the SETOOLS directory
pub const GEN_TOC: &str = "app-gen-toc";

/// Errors from manifest handling
#[derive(Debug, Error)]
pub enum ManifestError {
    /// An image named by the manifest does not exist
    #[error("{} not found", .0.display())]
    FileNotFound(PathBuf),

    /// The manifest is not usable
    #[error("Invalid manifest: {0}")]
    ManifestInvalid(String),

    /// The TOC generator exited with an error
    #[error("{GEN_TOC} failed ({status}):\n{stderr}")]
    ExternalToolFailure { status: String, stderr: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

#[derive(Debug, Deserialize)]
struct Entry {
    binary: Option<String>,
    #[serde(rename = "mramAddress")]
    mram_address: Option<String>,
    #[serde(default)]
    disabled: bool,
}

/// One image to be written, resolved from the manifest
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageEntry {
    /// Manifest key (TFA, DTB, ...)
    pub key: String,
    pub path: PathBuf,
    pub address: u32,
}

impl ImageEntry {
    /// File name for display
    pub fn file_name(&self) -> String {
        self.path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| self.path.display().to_string())
    }
}

/// Parse an address such as `0x80000000` or `80000000`
pub fn parse_address(s: &str) -> Result<u32, ManifestError> {
    let hex = s
        .trim()
        .strip_prefix("0x")
        .or_else(|| s.trim().strip_prefix("0X"))
        .unwrap_or(s.trim());
    u32::from_str_radix(hex, 16)
        .map_err(|e| ManifestError::ManifestInvalid(format!("bad mramAddress {:?}: {}", s, e)))
}

/// Extract the enabled images from manifest text, resolving binaries in `images_dir`
///
/// Entries without a binary or an address are skipped, as are disabled ones.
/// Files are not checked here; see [`check_files`].
pub fn parse_manifest(text: &str, images_dir: &Path) -> Result<Vec<ImageEntry>, ManifestError> {
    let root: HashMap<String, serde_json::Value> = serde_json::from_str(text)?;

    let mut images = Vec::new();
    for key in IMAGE_KEYS {
        let Some(value) = root.get(key) else {
            continue;
        };
        let entry: Entry = serde_json::from_value(value.clone())
            .map_err(|e| ManifestError::ManifestInvalid(format!("{}: {}", key, e)))?;
        if entry.disabled {
            log::debug!("manifest: {} disabled, skipping", key);
            continue;
        }
        let (Some(binary), Some(address)) = (entry.binary, entry.mram_address) else {
            log::debug!("manifest: {} has no binary or address, skipping", key);
            continue;
        };
        images.push(ImageEntry {
            key: key.to_string(),
            path: images_dir.join(binary),
            address: parse_address(&address)?,
        });
    }

    Ok(images)
}

/// Read and parse a manifest file
pub fn load_manifest(path: &Path, images_dir: &Path) -> Result<Vec<ImageEntry>, ManifestError> {
    let text = std::fs::read_to_string(path).map_err(|e| {
        if e.kind() == std::io::ErrorKind::NotFound {
            ManifestError::FileNotFound(path.to_path_buf())
        } else {
            ManifestError::Io(e)
        }
    })?;
    parse_manifest(&text, images_dir)
}

/// Fail on the first image file that does not exist
pub fn check_files(images: &[ImageEntry]) -> Result<(), ManifestError> {
    match images.iter().find(|image| !image.path.is_file()) {
        Some(missing) => Err(ManifestError::FileNotFound(missing.path.clone())),
        None => Ok(()),
    }
}

/// Run `app-gen-toc -f <config>` inside the SETOOLS directory
///
/// Returns the tool's standard output.
pub fn generate_toc(setools_dir: &Path, config: &Path) -> Result<String, ManifestError> {
    let config_arg = relative_to(config, setools_dir);
    log::debug!("Running ./{} -f {}", GEN_TOC, config_arg.display());

    let output = Command::new(Path::new(".").join(GEN_TOC))
        .arg("-f")
        .arg(&config_arg)
        .current_dir(setools_dir)
        .output()?;

    if !output.status.success() {
        return Err(ManifestError::ExternalToolFailure {
            status: output.status.to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        });
    }
    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

/// `path` relative to `base` when it lives below it, otherwise absolute
fn relative_to(path: &Path, base: &Path) -> PathBuf {
    let absolute = |p: &Path| std::fs::canonicalize(p).unwrap_or_else(|_| p.to_path_buf());
    let (path_abs, base_abs) = (absolute(path), absolute(base));
    match path_abs.strip_prefix(&base_abs) {
        Ok(relative) => relative.to_path_buf(),
        Err(_) => path_abs,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MANIFEST: &str = r#"
{
  "DEVICE": { "binary": "app-device-config.json" },
  "ROOTFS": { "binary": "cramfs-xip", "mramAddress": "0x80380000", "disabled": true },
  "KERNEL": { "binary": "xipImage", "mramAddress": "80020000" },
  "TFA": { "binary": "bl32.bin", "mramAddress": "0x80002000" },
  "DTB": { "binary": "devkit.dtb" }
}
"#;

    #[test]
    fn test_parse_address() {
        assert_eq!(parse_address("0x80000000").unwrap(), 0x8000_0000);
        assert_eq!(parse_address("0X8000").unwrap(), 0x8000);
        assert_eq!(parse_address("80020000").unwrap(), 0x8002_0000);
        assert!(matches!(
            parse_address("0xZZ"),
            Err(ManifestError::ManifestInvalid(_))
        ));
        assert!(parse_address("0x100000000").is_err());
    }

    #[test]
    fn test_parse_manifest() {
        let images = parse_manifest(MANIFEST, Path::new("/images")).unwrap();
        assert_eq!(
            images,
            vec![
                ImageEntry {
                    key: "TFA".to_string(),
                    path: PathBuf::from("/images/bl32.bin"),
                    address: 0x8000_2000,
                },
                ImageEntry {
                    key: "KERNEL".to_string(),
                    path: PathBuf::from("/images/xipImage"),
                    address: 0x8002_0000,
                },
            ]
        );
        assert_eq!(images[1].file_name(), "xipImage");
    }

    #[test]
    fn test_parse_manifest_errors() {
        assert!(matches!(
            parse_manifest("[1, 2]", Path::new(".")),
            Err(ManifestError::Json(_))
        ));
        assert!(matches!(
            parse_manifest(r#"{"TFA": {"binary": 3, "mramAddress": "0"}}"#, Path::new(".")),
            Err(ManifestError::ManifestInvalid(_))
        ));
        assert!(parse_manifest("{}", Path::new(".")).unwrap().is_empty());
    }

    #[test]
    fn test_missing_files() {
        let dir = std::env::temp_dir().join(format!("seflash-manifest-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join("bl32.bin"), [0u8; 4]).unwrap();

        let present = ImageEntry {
            key: "TFA".into(),
            path: dir.join("bl32.bin"),
            address: 0,
        };
        let missing = ImageEntry {
            key: "DTB".into(),
            path: dir.join("devkit.dtb"),
            address: 0,
        };
        assert!(check_files(&[present.clone()]).is_ok());
        match check_files(&[present, missing]) {
            Err(ManifestError::FileNotFound(path)) => assert_eq!(path, dir.join("devkit.dtb")),
            other => panic!("unexpected result: {:?}", other),
        }
        assert!(matches!(
            load_manifest(&dir.join("nope.json"), &dir),
            Err(ManifestError::FileNotFound(_))
        ));

        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn test_relative_to() {
        assert_eq!(
            relative_to(Path::new("/no/such/setools/build/a.json"), Path::new("/no/such/setools")),
            PathBuf::from("build/a.json")
        );
        assert_eq!(
            relative_to(Path::new("/elsewhere/a.json"), Path::new("/no/such/setools")),
            PathBuf::from("/elsewhere/a.json")
        );
    }
}
