//! Certificate rendering.
//!
//! Every recipient gets a private copy of the template with their name drawn
//! at the configured anchor, saved as `<Name_With_Underscores>.png`.

pub mod text;

use std::fs::{self, File};
use std::io::{self, BufWriter};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Result;
use image::codecs::png::{CompressionType, FilterType, PngEncoder};
use image::{ColorType, ImageEncoder, ImageError, RgbaImage};
use thiserror::Error;
use tracing::{debug, info};

pub use text::{parse_hex_color, resolve_font, Alignment, FontPainter, TextPainter, TextStyle};

use crate::pool::{self, PoolError, WorkerPool};
use crate::progress::{BatchHandle, Cleanup, SharedProgress};
use crate::userlist::Recipient;

/// Name and address used instead of the list in test mode.
pub const SAMPLE_NAME: &str = "Name Surname";
pub const SAMPLE_EMAIL: &str = "what@gmail.com";

pub const MAX_COMPRESS_LEVEL: u8 = 9;

#[derive(Debug, Error)]
pub enum RenderError {
    #[error("failed to open template {path}: {source}")]
    Template {
        path: PathBuf,
        #[source]
        source: ImageError,
    },

    #[error("failed to load font {path}: {reason}")]
    Font { path: PathBuf, reason: String },

    #[error("failed to write {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to encode {path}: {source}")]
    Encode {
        path: PathBuf,
        #[source]
        source: ImageError,
    },

    #[error(transparent)]
    Pool(#[from] PoolError),
}

/// `"Jane Doe"` becomes `"Jane_Doe.png"`.
pub fn certificate_file_name(name: &str) -> String {
    format!("{}.png", name.replace(' ', "_"))
}

pub fn certificate_path(dir: &Path, name: &str) -> PathBuf {
    dir.join(certificate_file_name(name))
}

pub fn sample_recipient() -> Recipient {
    Recipient::new(0, SAMPLE_NAME, SAMPLE_EMAIL)
}

/// Map a 0-9 compression level onto the PNG encoder presets.
pub fn compression_for_level(level: u8) -> CompressionType {
    match level {
        0..=2 => CompressionType::Fast,
        3..=6 => CompressionType::Default,
        _ => CompressionType::Best,
    }
}

/// Shared, read-only state for a render batch.
#[derive(Clone)]
pub struct CertificateRenderer {
    template: Arc<RgbaImage>,
    output_dir: PathBuf,
    painter: Arc<dyn TextPainter>,
    style: TextStyle,
    compress_level: u8,
    threads: usize,
}

impl CertificateRenderer {
    pub fn new(
        template: RgbaImage,
        output_dir: impl Into<PathBuf>,
        painter: Arc<dyn TextPainter>,
        style: TextStyle,
        compress_level: u8,
    ) -> Self {
        Self {
            template: Arc::new(template),
            output_dir: output_dir.into(),
            painter,
            style,
            compress_level: compress_level.min(MAX_COMPRESS_LEVEL),
            threads: pool::render_threads(),
        }
    }

    /// Load and decode the template before anything is rendered.
    pub fn open(
        template_path: &Path,
        output_dir: impl Into<PathBuf>,
        painter: Arc<dyn TextPainter>,
        style: TextStyle,
        compress_level: u8,
    ) -> Result<Self, RenderError> {
        let template = image::open(template_path)
            .map_err(|source| RenderError::Template {
                path: template_path.to_path_buf(),
                source,
            })?
            .to_rgba8();
        debug!(
            "loaded template {} ({}x{})",
            template_path.display(),
            template.width(),
            template.height()
        );
        Ok(Self::new(template, output_dir, painter, style, compress_level))
    }

    pub fn with_threads(mut self, threads: usize) -> Self {
        self.threads = threads.max(1);
        self
    }

    pub fn output_dir(&self) -> &Path {
        &self.output_dir
    }

    pub fn style(&self) -> &TextStyle {
        &self.style
    }

    /// Draw one certificate and save it. Returns the written path.
    pub fn render_one(&self, recipient: &Recipient) -> Result<PathBuf, RenderError> {
        let mut canvas = (*self.template).clone();
        self.painter
            .paint_anchored(&mut canvas, &self.style, &recipient.name);

        let path = certificate_path(&self.output_dir, &recipient.name);
        self.save_png(&canvas, &path)?;
        Ok(path)
    }

    /// Render every recipient on a worker pool.
    ///
    /// Results are consumed in submission order: for each finished
    /// certificate the progress counter is bumped and `on_log` is called.
    /// The first failure stops the batch and is returned.
    pub fn render_all<F>(
        &self,
        recipients: &[Recipient],
        progress: &SharedProgress,
        on_log: F,
    ) -> Result<usize, RenderError>
    where
        F: FnMut(&Recipient),
    {
        self.render_batch(recipients, progress, on_log, || {})
    }

    fn render_batch<F, D>(
        &self,
        recipients: &[Recipient],
        progress: &SharedProgress,
        mut on_log: F,
        all_submitted: D,
    ) -> Result<usize, RenderError>
    where
        F: FnMut(&Recipient),
        D: FnOnce(),
    {
        fs::create_dir_all(&self.output_dir).map_err(|source| RenderError::Io {
            path: self.output_dir.clone(),
            source,
        })?;

        let pool = WorkerPool::new(self.threads, "render")?;
        info!(
            "rendering {} certificates on {} threads",
            recipients.len(),
            pool.threads()
        );

        let mut rendered = 0;
        pool.map_ordered_with(
            recipients,
            |recipient| self.render_one(recipient),
            |recipient, result| -> Result<(), RenderError> {
                let path = result?;
                debug!("wrote {}", path.display());
                progress.increment();
                on_log(recipient);
                rendered += 1;
                Ok(())
            },
            all_submitted,
        )?;
        Ok(rendered)
    }

    fn save_png(&self, canvas: &RgbaImage, path: &Path) -> Result<(), RenderError> {
        let io_err = |source| RenderError::Io {
            path: path.to_path_buf(),
            source,
        };
        let file = File::create(path).map_err(io_err)?;
        let encoder = PngEncoder::new_with_quality(
            BufWriter::new(file),
            compression_for_level(self.compress_level),
            FilterType::Adaptive,
        );
        encoder
            .write_image(canvas.as_raw(), canvas.width(), canvas.height(), ColorType::Rgba8)
            .map_err(|source| RenderError::Encode {
                path: path.to_path_buf(),
                source,
            })
    }
}

/// Run [`CertificateRenderer::render_all`] on a background thread.
///
/// The pool is torn down when the batch finishes; `cleanup` then runs once
/// after the settle delay.
pub fn spawn_render<F>(
    renderer: CertificateRenderer,
    recipients: Vec<Recipient>,
    progress: SharedProgress,
    on_log: F,
    cleanup: Option<Cleanup>,
) -> Result<BatchHandle<Result<usize, RenderError>>>
where
    F: FnMut(&Recipient) + Send + 'static,
{
    BatchHandle::spawn(
        "render-batch",
        progress,
        move |ctx| {
            renderer.render_batch(&recipients, ctx.progress(), on_log, || ctx.all_submitted())
        },
        cleanup,
    )
}
