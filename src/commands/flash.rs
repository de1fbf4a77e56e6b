//! Flash command

use super::IndicatifProgress;
use crate::manifest::{self, ImageEntry, ManifestError};
use seflash_isp::{Image, Opener, Orchestrator};
use std::path::PathBuf;

/// Inputs of the flash command
pub struct FlashArgs {
    /// ATOC JSON config
    pub config: PathBuf,
    pub setools_dir: PathBuf,
    /// Regenerate the ATOC before flashing
    pub gen_toc: bool,
    /// Enter maintenance mode first
    pub maintenance: bool,
}

impl FlashArgs {
    /// Directory the manifest's binaries are resolved against
    pub fn images_dir(&self) -> PathBuf {
        self.setools_dir.join("build").join("images")
    }
}

/// Regenerate the ATOC if asked, then resolve and load every image
///
/// Runs after the optional maintenance step, since entering maintenance mode
/// has to happen right after a power cycle.
fn prepare_images(args: &FlashArgs) -> Result<Vec<Image>, ManifestError> {
    if args.gen_toc {
        println!("\n=== Generating ATOC ===");
        let stdout = manifest::generate_toc(&args.setools_dir, &args.config)?;
        print!("{}", stdout);
    }

    let entries = manifest::load_manifest(&args.config, &args.images_dir())?;
    manifest::check_files(&entries)?;
    if entries.is_empty() {
        return Ok(Vec::new());
    }

    let images = entries
        .iter()
        .map(load_image)
        .collect::<Result<Vec<_>, _>>()?;
    print_image_table(&images);
    Ok(images)
}

fn load_image(entry: &ImageEntry) -> Result<Image, ManifestError> {
    let data = std::fs::read(&entry.path)?;
    log::debug!(
        "{}: {} ({} bytes) -> 0x{:08X}",
        entry.key,
        entry.path.display(),
        data.len(),
        entry.address
    );
    Ok(Image::new(entry.file_name(), data, entry.address))
}

fn print_image_table(images: &[Image]) {
    let total: usize = images.iter().map(|i| i.data.len()).sum();
    println!("\n=== Flashing {} images ({} bytes) ===", images.len(), total);
    for image in images {
        println!(
            "  {:<45} -> 0x{:08X} ({:>10} bytes)",
            image.name,
            image.address,
            image.data.len()
        );
    }
    println!();
}

/// Flash every enabled image of the manifest
pub fn run_flash<O: Opener>(isp: &mut Orchestrator<O>, args: &FlashArgs) -> bool {
    log::debug!("Manifest: {}", args.config.display());

    let mut progress = IndicatifProgress::new();
    let outcome = isp.flash(
        args.maintenance,
        || prepare_images(args).map_err(|e| format!("Error: {}", e)),
        &mut progress,
    );
    drop(progress);

    let summary = &outcome.report;
    for image in &summary.images {
        log::info!(
            "{}: {} bytes at 0x{:08X} in {:.1}s ({:.0} B/s)",
            image.name,
            image.padded_len,
            image.address,
            image.elapsed.as_secs_f32(),
            image.bytes_per_sec()
        );
    }
    super::print_diagnostics(&outcome.diagnostics);

    outcome.success
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_images_dir() {
        let args = FlashArgs {
            config: PathBuf::from("cfg.json"),
            setools_dir: PathBuf::from("tools/setools"),
            gen_toc: false,
            maintenance: false,
        };
        assert_eq!(args.images_dir(), PathBuf::from("tools/setools/build/images"));
    }

    #[test]
    fn test_prepare_missing_manifest() {
        let args = FlashArgs {
            config: PathBuf::from("/no/such/config.json"),
            setools_dir: PathBuf::from("/no/such"),
            gen_toc: false,
            maintenance: false,
        };
        assert!(matches!(
            prepare_images(&args),
            Err(ManifestError::FileNotFound(_))
        ));
    }
}
