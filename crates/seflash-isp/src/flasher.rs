//! MRAM image writer
//!
//! Each image is zero-padded to the MRAM alignment, declared with
//! BURN_MRAM, streamed as sequenced DOWNLOAD_DATA chunks and closed with
//! DOWNLOAD_DONE. A chunk that is not acknowledged stops the whole flash,
//! except for the last chunk of an image: some enclave firmware never acks
//! that one even though it commits the data.

use crate::error::{IspError, Result};
use crate::protocol::{self, Command};
use crate::session::{IspSession, ReplyStatus};
use crate::transport::Opener;
use std::time::{Duration, Instant};

/// One image to write
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Image {
    /// Display name (usually the file name)
    pub name: String,
    /// Raw image bytes, unpadded
    pub data: Vec<u8>,
    /// MRAM destination address
    pub address: u32,
}

impl Image {
    pub fn new(name: impl Into<String>, data: Vec<u8>, address: u32) -> Self {
        Self {
            name: name.into(),
            data,
            address,
        }
    }
}

/// Progress within one image
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransferProgress {
    /// Index of the chunk just sent (0-based)
    pub chunk_index: usize,
    /// Number of chunks in the image
    pub total_chunks: usize,
    /// Padded bytes sent so far
    pub bytes_sent: usize,
    /// Padded image size
    pub total_bytes: usize,
    /// Time since the first chunk was sent
    pub elapsed: Duration,
}

impl TransferProgress {
    /// Completion in whole percent
    pub fn percent(&self) -> usize {
        if self.total_bytes == 0 {
            100
        } else {
            100 * self.bytes_sent / self.total_bytes
        }
    }
}

/// Outcome of writing one image
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageReport {
    pub name: String,
    pub address: u32,
    /// Size before padding
    pub original_len: usize,
    /// Size actually written
    pub padded_len: usize,
    pub chunks: usize,
    pub elapsed: Duration,
    /// Whether the enclave acked the last chunk
    pub final_chunk_acked: bool,
}

impl ImageReport {
    /// Throughput in bytes per second
    pub fn bytes_per_sec(&self) -> f64 {
        let secs = self.elapsed.as_secs_f64();
        if secs > 0.0 {
            self.padded_len as f64 / secs
        } else {
            0.0
        }
    }
}

/// Progress callbacks for image writes
pub trait FlashProgress {
    /// Called after BURN_MRAM was accepted, before the first chunk
    fn image_started(&mut self, image: &Image, padded_len: usize, total_chunks: usize);

    /// Called after every chunk
    fn chunk_sent(&mut self, progress: &TransferProgress);

    /// Called once DOWNLOAD_DONE has been sent
    fn image_finished(&mut self, report: &ImageReport);
}

/// A no-op progress reporter
pub struct NoProgress;

impl FlashProgress for NoProgress {
    fn image_started(&mut self, _image: &Image, _padded_len: usize, _total_chunks: usize) {}
    fn chunk_sent(&mut self, _progress: &TransferProgress) {}
    fn image_finished(&mut self, _report: &ImageReport) {}
}

/// Number of chunks needed for `len` bytes
pub fn chunk_count(len: usize, chunk_size: usize) -> usize {
    len.div_ceil(chunk_size)
}

/// Writes images through an ISP session that is already in ISP mode
pub struct ImageFlasher<'a, O: Opener> {
    session: &'a mut IspSession<O>,
    progress: &'a mut dyn FlashProgress,
}

impl<'a, O: Opener> ImageFlasher<'a, O> {
    pub fn new(session: &'a mut IspSession<O>, progress: &'a mut dyn FlashProgress) -> Self {
        Self { session, progress }
    }

    /// Write every image in order, stopping at the first failure
    pub fn write_all(&mut self, images: &[Image]) -> Result<Vec<ImageReport>> {
        let mut reports = Vec::with_capacity(images.len());
        for image in images {
            reports.push(self.write_image(image)?);
        }
        Ok(reports)
    }

    /// Write a single image
    pub fn write_image(&mut self, image: &Image) -> Result<ImageReport> {
        let config = self.session.config().clone();

        let data = protocol::pad_to_alignment(&image.data, config.alignment);
        let size = data.len();
        let total = chunk_count(size, config.chunk_size);
        if total > usize::from(u16::MAX) + 1 || u32::try_from(size).is_err() {
            return Err(IspError::ImageTooLarge {
                image: image.name.clone(),
                size: image.data.len(),
            });
        }

        log::info!(
            "  [{}] {} bytes (padded to {}) -> 0x{:08X}",
            image.name,
            image.data.len(),
            size,
            image.address
        );

        let payload = protocol::burn_mram_payload(image.address, size as u32);
        let reply = self.session.issue(Command::BurnMram, &payload)?;
        if !reply.accepted() {
            log::error!("  BURN_MRAM rejected for {}: {}", image.name, reply);
        }
        reply.into_result(Command::BurnMram)?;

        self.progress.image_started(image, size, total);

        let start = Instant::now();
        let mut sent = 0;
        let mut final_chunk_acked = true;
        for (index, chunk) in data.chunks(config.chunk_size).enumerate() {
            let payload = protocol::download_data_payload(index as u16, chunk);
            let response = self.session.link().send_and_receive(
                Command::DownloadData,
                &payload,
                config.chunk_settle,
                config.chunk_timeout,
            )?;

            let status = ReplyStatus::from_response(response.as_ref());
            if !matches!(status, ReplyStatus::Ack | ReplyStatus::Data) {
                let code = response.map(|r| r.command);
                let label = code.map_or_else(
                    || "no response".to_string(),
                    |c| format!("0x{:02X}", c),
                );
                if index + 1 < total {
                    log::error!("  Chunk {}/{}: {}", index, total, label);
                    return Err(IspError::ChunkRejected {
                        image: image.name.clone(),
                        index,
                        total,
                        response: code,
                    });
                }
                log::warn!(
                    "  Chunk {}/{}: {} (final chunk, assuming committed)",
                    index,
                    total,
                    label
                );
                final_chunk_acked = false;
            }

            sent += chunk.len();
            let progress = TransferProgress {
                chunk_index: index,
                total_chunks: total,
                bytes_sent: sent,
                total_bytes: size,
                elapsed: start.elapsed(),
            };
            self.progress.chunk_sent(&progress);

            let done = index + 1;
            if done % config.progress_interval == 0 || done == total {
                log::info!(
                    "  {}/{} ({}%) [{:.1}s]",
                    done,
                    total,
                    progress.percent(),
                    progress.elapsed.as_secs_f32()
                );
            }
        }

        let done = self.session.issue(Command::DownloadDone, &[])?;
        if !done.accepted() {
            log::warn!("  DOWNLOAD_DONE: {}", done);
        }

        let report = ImageReport {
            name: image.name.clone(),
            address: image.address,
            original_len: image.data.len(),
            padded_len: size,
            chunks: total,
            elapsed: start.elapsed(),
            final_chunk_acked,
        };
        log::info!(
            "  Done: {} bytes in {:.1}s ({:.0} B/s)",
            size,
            report.elapsed.as_secs_f32(),
            report.bytes_per_sec()
        );
        self.progress.image_finished(&report);
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chunk_count() {
        assert_eq!(chunk_count(0, 240), 0);
        assert_eq!(chunk_count(1, 240), 1);
        assert_eq!(chunk_count(240, 240), 1);
        assert_eq!(chunk_count(241, 240), 2);
        assert_eq!(chunk_count(1008, 240), 5);
    }

    #[test]
    fn test_chunks_reassemble() {
        let data: Vec<u8> = (0..1000u32).map(|i| (i * 7) as u8).collect();
        let padded = protocol::pad_to_alignment(&data, 16);
        let chunks: Vec<&[u8]> = padded.chunks(240).collect();
        assert_eq!(chunks.len(), chunk_count(padded.len(), 240));
        assert_eq!(chunks.last().unwrap().len(), 48);
        assert_eq!(chunks.concat(), padded);
    }

    #[test]
    fn test_progress_percent() {
        let progress = TransferProgress {
            chunk_index: 2,
            total_chunks: 5,
            bytes_sent: 720,
            total_bytes: 1008,
            elapsed: Duration::ZERO,
        };
        assert_eq!(progress.percent(), 71);
    }
}
