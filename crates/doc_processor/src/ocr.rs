//! OCR fallback for scanned PDFs. Shells out to poppler's `pdftoppm` for
//! rasterization and `tesseract` for recognition (Macedonian + English
//! traineddata). Both tools are optional at runtime; their absence turns
//! into a per-document failure, never a crash.

use anyhow::{anyhow, Context, Result};
use std::path::Path;
use tokio::process::Command;
use tracing::{debug, info};

/// Rasterization density. 200 dpi keeps tesseract accurate without
/// ballooning the temp files.
const RENDER_DPI: &str = "200";
const OCR_LANGS: &str = "mkd+eng";

/// True when both external tools answer a version probe.
pub async fn ocr_available() -> bool {
    tool_answers("pdftoppm", "-v").await && tool_answers("tesseract", "--version").await
}

async fn tool_answers(tool: &str, flag: &str) -> bool {
    Command::new(tool)
        .arg(flag)
        .output()
        .await
        .map(|out| out.status.success() || !out.stderr.is_empty())
        .unwrap_or(false)
}

/// OCR a whole PDF: rasterize every page, recognize each, concatenate.
pub async fn ocr_pdf(pdf_bytes: &[u8]) -> Result<String> {
    let workdir = tempfile::tempdir().context("could not create OCR temp dir")?;
    let pdf_path = workdir.path().join("document.pdf");
    tokio::fs::write(&pdf_path, pdf_bytes)
        .await
        .context("could not stage PDF for OCR")?;

    let prefix = workdir.path().join("page");
    let raster = Command::new("pdftoppm")
        .arg("-r")
        .arg(RENDER_DPI)
        .arg("-png")
        .arg(&pdf_path)
        .arg(&prefix)
        .output()
        .await
        .context("pdftoppm is not available")?;
    if !raster.status.success() {
        return Err(anyhow!(
            "pdftoppm failed: {}",
            String::from_utf8_lossy(&raster.stderr)
        ));
    }

    let mut pages = page_images(workdir.path()).await?;
    pages.sort();
    if pages.is_empty() {
        return Err(anyhow!("pdftoppm produced no page images"));
    }
    debug!("OCR over {} rasterized pages", pages.len());

    let mut chunks = Vec::with_capacity(pages.len());
    for image in &pages {
        let recognized = Command::new("tesseract")
            .arg(image)
            .arg("stdout")
            .arg("-l")
            .arg(OCR_LANGS)
            .output()
            .await
            .context("tesseract is not available")?;
        if !recognized.status.success() {
            return Err(anyhow!(
                "tesseract failed on {}: {}",
                image.display(),
                String::from_utf8_lossy(&recognized.stderr)
            ));
        }
        chunks.push(String::from_utf8_lossy(&recognized.stdout).into_owned());
    }

    let text = chunks.join("\n");
    info!("OCR recovered {} characters", text.len());
    Ok(text)
}

async fn page_images(dir: &Path) -> Result<Vec<std::path::PathBuf>> {
    let mut entries = tokio::fs::read_dir(dir).await?;
    let mut images = Vec::new();
    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        if path.extension().map(|e| e == "png").unwrap_or(false) {
            images.push(path);
        }
    }
    Ok(images)
}
