//! Progress bars for MRAM writes

use indicatif::{MultiProgress, ProgressBar, ProgressStyle};
use seflash_isp::{FlashProgress, Image, ImageReport, TransferProgress};

fn create_bar_style(name: &str) -> Result<ProgressStyle, indicatif::style::TemplateError> {
    Ok(ProgressStyle::default_bar()
        .template(&format!(
            "{{spinner:.green}} {:<12} [{{elapsed_precise}}] [{{bar:40.cyan/blue}}] {{bytes}}/{{total_bytes}} ({{bytes_per_sec}}, {{eta}}) {{msg}}",
            name
        ))?
        .progress_chars("#>-"))
}

/// Progress reporter using indicatif, one bar per image
pub struct IndicatifProgress {
    multi: MultiProgress,
    current_bar: Option<ProgressBar>,
}

impl IndicatifProgress {
    pub fn new() -> Self {
        Self {
            multi: MultiProgress::new(),
            current_bar: None,
        }
    }
}

impl Default for IndicatifProgress {
    fn default() -> Self {
        Self::new()
    }
}

impl FlashProgress for IndicatifProgress {
    fn image_started(&mut self, image: &Image, padded_len: usize, _total_chunks: usize) {
        let pb = ProgressBar::new(padded_len as u64);
        pb.set_style(create_bar_style(&image.name).unwrap_or_else(|_| ProgressStyle::default_bar()));
        self.current_bar = Some(self.multi.add(pb));
    }

    fn chunk_sent(&mut self, progress: &TransferProgress) {
        if let Some(pb) = &self.current_bar {
            pb.set_position(progress.bytes_sent as u64);
        }
    }

    fn image_finished(&mut self, report: &ImageReport) {
        if let Some(pb) = self.current_bar.take() {
            let message = if report.final_chunk_acked {
                "done"
            } else {
                "done (last chunk unacknowledged)"
            };
            pb.finish_with_message(message);
        }
    }
}

impl Drop for IndicatifProgress {
    fn drop(&mut self) {
        if let Some(pb) = self.current_bar.take() {
            pb.abandon_with_message("aborted");
        }
    }
}
