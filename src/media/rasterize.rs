use std::time::Duration;
use tokio::process::Command;
use tracing::debug;

use crate::config::Converter;
use crate::media::MediaError;

/// Check that the configured converter can be spawned (`pdftoppm -v`).
pub async fn ensure_converter_available(program: &str) -> Result<(), MediaError> {
    let status = Command::new(program)
        .arg("-v")
        .kill_on_drop(true)
        .output()
        .await;
    match status {
        Ok(out) if out.status.success() => Ok(()),
        Ok(out) => Err(MediaError::Conversion(format!(
            "{} not available (exit status {})",
            program, out.status
        ))),
        Err(e) => Err(MediaError::Conversion(format!("{} not available: {}", program, e))),
    }
}

/// Render the first page of a PDF to PNG bytes at the configured resolution.
pub async fn rasterize_first_page(pdf: &[u8], converter: &Converter) -> Result<Vec<u8>, MediaError> {
    if !converter.enabled {
        return Err(MediaError::ConversionDisabled);
    }

    let workdir = tempfile::tempdir()?;
    let input = workdir.path().join("source.pdf");
    tokio::fs::write(&input, pdf).await?;
    let prefix = workdir.path().join("page");

    let run = Command::new(&converter.program)
        .arg("-png")
        .arg("-r")
        .arg(converter.dpi.to_string())
        .args(["-f", "1", "-l", "1", "-singlefile"])
        .arg(input.as_os_str())
        .arg(prefix.as_os_str())
        .kill_on_drop(true)
        .output();

    let output = tokio::time::timeout(Duration::from_secs(converter.timeout_secs), run)
        .await
        .map_err(|_| MediaError::Timeout)?
        .map_err(|e| MediaError::Conversion(format!("failed to spawn {}: {}", converter.program, e)))?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(MediaError::Conversion(format!(
            "{} exited with status {}: {}",
            converter.program,
            output.status,
            stderr.trim()
        )));
    }

    // -singlefile writes `{prefix}.png`
    let png = prefix.with_extension("png");
    let bytes = tokio::fs::read(&png).await.map_err(|e| {
        MediaError::Conversion(format!("no page rendered at {}: {}", png.display(), e))
    })?;
    debug!(bytes = bytes.len(), dpi = converter.dpi, "document page rendered");
    Ok(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn converter(program: &str, enabled: bool) -> Converter {
        Converter {
            enabled,
            program: program.into(),
            dpi: 72,
            timeout_secs: 5,
        }
    }

    #[tokio::test]
    async fn disabled_converter_is_skipped() {
        let err = rasterize_first_page(b"%PDF", &converter("pdftoppm", false))
            .await
            .unwrap_err();
        assert!(matches!(err, MediaError::ConversionDisabled));
    }

    #[tokio::test]
    async fn missing_program_is_a_conversion_error() {
        let cfg = converter("definitely-not-a-real-converter", true);
        let err = rasterize_first_page(b"%PDF-1.4", &cfg).await.unwrap_err();
        assert!(matches!(err, MediaError::Conversion(_)));
        assert!(ensure_converter_available(&cfg.program).await.is_err());
    }
}
