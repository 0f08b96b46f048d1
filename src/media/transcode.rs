//! Decode, check, fit and re-encode images to WebP.
use image::imageops::{self, FilterType};
use image::{DynamicImage, GenericImageView, Rgba, RgbaImage};
use resvg::{tiny_skia, usvg};

use crate::config::Canvas;
use crate::media::MediaError;

pub const MIN_DIMENSION: u32 = 10;
pub const MAX_DIMENSION: u32 = 4000;
pub const MAX_ASPECT_RATIO: f64 = 3.0;

const WHITE: Rgba<u8> = Rgba([255, 255, 255, 255]);
const TRANSPARENT: Rgba<u8> = Rgba([0, 0, 0, 0]);

/// What the fetched bytes turned out to be.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceKind {
    Raster,
    Document,
    Icon,
    /// SVG, rendered in-process.
    Vector,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EncodeProfile {
    pub quality: f32,
    pub keep_alpha: bool,
}

impl SourceKind {
    pub fn profile(&self) -> EncodeProfile {
        match self {
            SourceKind::Raster => EncodeProfile { quality: 80.0, keep_alpha: false },
            SourceKind::Icon => EncodeProfile { quality: 90.0, keep_alpha: true },
            SourceKind::Document | SourceKind::Vector => {
                EncodeProfile { quality: 85.0, keep_alpha: false }
            }
        }
    }
}

/// How an image is placed on the target canvas.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fit {
    /// Fill the canvas, cropping overflow; the top edge is kept.
    CoverTop,
    /// Fit entirely inside the canvas, centered.
    Inside,
}

fn mime_essence(content_type: &str) -> String {
    content_type
        .split(';')
        .next()
        .unwrap_or(content_type)
        .trim()
        .to_lowercase()
}

/// Whether a declared `Content-Type` may carry something we can turn into an image.
pub fn accepts_content_type(content_type: Option<&str>) -> bool {
    let Some(ct) = content_type.map(mime_essence).filter(|c| !c.is_empty()) else {
        return true;
    };
    ct.starts_with("image/")
        || ct == "application/pdf"
        || ct == "application/octet-stream"
        || ct == "binary/octet-stream"
}

fn url_extension(url: &str) -> Option<String> {
    let path = url.split(['?', '#']).next().unwrap_or(url);
    let file = path.rsplit('/').next()?;
    let (_, ext) = file.rsplit_once('.')?;
    Some(ext.to_lowercase())
}

/// SVG markup: an `<svg` root, possibly behind an XML prolog or doctype.
fn looks_like_svg(bytes: &[u8]) -> bool {
    let head = &bytes[..bytes.len().min(1024)];
    let head = head.strip_prefix(b"\xEF\xBB\xBF").unwrap_or(head);
    let text = String::from_utf8_lossy(head);
    let text = text.trim_start();
    (text.starts_with("<svg") || text.starts_with("<?xml") || text.starts_with("<!"))
        && text.contains("<svg")
}

/// Classify by magic bytes first, then declared type, then URL extension.
pub fn detect_kind(content_type: Option<&str>, url: &str, bytes: &[u8]) -> SourceKind {
    if bytes.starts_with(b"%PDF") {
        return SourceKind::Document;
    }
    if bytes.starts_with(&[0x00, 0x00, 0x01, 0x00]) {
        return SourceKind::Icon;
    }
    if looks_like_svg(bytes) {
        return SourceKind::Vector;
    }
    if let Some(found) = infer::get(bytes) {
        match found.mime_type() {
            "application/pdf" => return SourceKind::Document,
            "image/vnd.microsoft.icon" | "image/x-icon" => return SourceKind::Icon,
            m if m.starts_with("image/") => return SourceKind::Raster,
            _ => {}
        }
    }
    match content_type.map(mime_essence).as_deref() {
        Some("application/pdf") => return SourceKind::Document,
        Some("image/x-icon") | Some("image/vnd.microsoft.icon") => return SourceKind::Icon,
        Some("image/svg+xml") => return SourceKind::Vector,
        _ => {}
    }
    match url_extension(url).as_deref() {
        Some("pdf") => SourceKind::Document,
        Some("ico") => SourceKind::Icon,
        Some("svg") | Some("svgz") => SourceKind::Vector,
        _ => SourceKind::Raster,
    }
}

pub fn decode(bytes: &[u8]) -> Result<DynamicImage, MediaError> {
    Ok(image::load_from_memory(bytes)?)
}

/// Render SVG bytes large enough to cover `canvas`, so the later steps only
/// ever shrink the result.
pub fn rasterize_svg(bytes: &[u8], canvas: Canvas) -> Result<DynamicImage, MediaError> {
    let tree = usvg::Tree::from_data(bytes, &usvg::Options::default())
        .map_err(|e| MediaError::Vector(e.to_string()))?;
    let size = tree.size();
    let (w, h) = (size.width(), size.height());
    let scale = (canvas.width as f32 / w)
        .max(canvas.height as f32 / h)
        .min(MAX_DIMENSION as f32 / w.max(h));
    let width = ((w * scale).round() as u32).max(1);
    let height = ((h * scale).round() as u32).max(1);

    let mut pixmap = tiny_skia::Pixmap::new(width, height)
        .ok_or_else(|| MediaError::Vector(format!("cannot allocate {}x{} pixmap", width, height)))?;
    resvg::render(&tree, tiny_skia::Transform::from_scale(scale, scale), &mut pixmap.as_mut());

    // tiny-skia stores premultiplied alpha.
    let rgba: Vec<u8> = pixmap
        .pixels()
        .iter()
        .flat_map(|p| {
            let c = p.demultiply();
            [c.red(), c.green(), c.blue(), c.alpha()]
        })
        .collect();
    let img = RgbaImage::from_raw(width, height, rgba)
        .ok_or_else(|| MediaError::Vector("pixel buffer size mismatch".into()))?;
    Ok(DynamicImage::ImageRgba8(img))
}

/// Reject unusable sizes; returns warnings for odd but usable ones.
pub fn validate(img: &DynamicImage) -> Result<Vec<String>, MediaError> {
    let (width, height) = img.dimensions();
    let in_range = |d: u32| (MIN_DIMENSION..=MAX_DIMENSION).contains(&d);
    if !in_range(width) || !in_range(height) {
        return Err(MediaError::Dimensions { width, height });
    }
    let ratio = f64::from(width.max(height)) / f64::from(width.min(height));
    let mut warnings = Vec::new();
    if ratio > MAX_ASPECT_RATIO {
        warnings.push(format!("aspect ratio {:.2} for {}x{}", ratio, width, height));
    }
    Ok(warnings)
}

fn scaled(value: u32, factor: f64) -> u32 {
    ((f64::from(value) * factor).round() as u32).max(1)
}

/// Place `img` on a `canvas`-sized image without ever enlarging it.
pub fn compose(img: &DynamicImage, fit: Fit, canvas: Canvas, keep_alpha: bool) -> RgbaImage {
    let (w, h) = img.dimensions();
    let sx = f64::from(canvas.width) / f64::from(w);
    let sy = f64::from(canvas.height) / f64::from(h);
    let factor = match fit {
        Fit::CoverTop => sx.max(sy),
        Fit::Inside => sx.min(sy),
    }
    .min(1.0);

    let (nw, nh) = (scaled(w, factor), scaled(h, factor));
    let resized = if (nw, nh) == (w, h) {
        img.to_rgba8()
    } else {
        img.resize_exact(nw, nh, FilterType::Lanczos3).to_rgba8()
    };

    let placed = match fit {
        Fit::CoverTop if nw > canvas.width || nh > canvas.height => {
            let cw = nw.min(canvas.width);
            let ch = nh.min(canvas.height);
            let x = (nw - cw) / 2;
            imageops::crop_imm(&resized, x, 0, cw, ch).to_image()
        }
        _ => resized,
    };

    let background = if keep_alpha { TRANSPARENT } else { WHITE };
    let mut out = RgbaImage::from_pixel(canvas.width, canvas.height, background);
    let x = i64::from(canvas.width.saturating_sub(placed.width()) / 2);
    let y = i64::from(canvas.height.saturating_sub(placed.height()) / 2);
    imageops::overlay(&mut out, &placed, x, y);
    out
}

pub fn encode_webp(img: &RgbaImage, profile: EncodeProfile) -> Vec<u8> {
    let (w, h) = img.dimensions();
    if profile.keep_alpha {
        webp::Encoder::from_rgba(img.as_raw(), w, h)
            .encode(profile.quality)
            .to_vec()
    } else {
        let rgb = DynamicImage::ImageRgba8(img.clone()).to_rgb8();
        webp::Encoder::from_rgb(rgb.as_raw(), w, h)
            .encode(profile.quality)
            .to_vec()
    }
}

/// Full image path: decode (or render), check, fit and encode. Returns the WebP bytes
/// and any warnings raised along the way.
pub fn transcode(
    bytes: &[u8],
    kind: SourceKind,
    fit: Fit,
    canvas: Canvas,
) -> Result<(Vec<u8>, Vec<String>), MediaError> {
    let img = match kind {
        SourceKind::Vector => rasterize_svg(bytes, canvas)?,
        _ => decode(bytes)?,
    };
    let warnings = validate(&img)?;
    let profile = kind.profile();
    let composed = compose(&img, fit, canvas, profile.keep_alpha);
    Ok((encode_webp(&composed, profile), warnings))
}

/// Plain white image of the given size.
pub fn placeholder(canvas: Canvas) -> Vec<u8> {
    let img = RgbaImage::from_pixel(canvas.width, canvas.height, WHITE);
    encode_webp(&img, SourceKind::Raster.profile())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    const SQUARE: Canvas = Canvas { width: 400, height: 400 };

    fn png(width: u32, height: u32, color: Rgba<u8>) -> Vec<u8> {
        let img = RgbaImage::from_pixel(width, height, color);
        let mut out = Cursor::new(Vec::new());
        DynamicImage::ImageRgba8(img)
            .write_to(&mut out, image::ImageFormat::Png)
            .unwrap();
        out.into_inner()
    }

    #[test]
    fn content_type_gate() {
        assert!(accepts_content_type(Some("image/png")));
        assert!(accepts_content_type(Some("application/pdf; charset=binary")));
        assert!(accepts_content_type(None));
        assert!(!accepts_content_type(Some("text/html; charset=utf-8")));
    }

    #[test]
    fn detects_kinds() {
        assert_eq!(detect_kind(None, "https://x/a", b"%PDF-1.7 ..."), SourceKind::Document);
        assert_eq!(detect_kind(None, "https://x/a", &[0, 0, 1, 0, 1, 0]), SourceKind::Icon);
        assert_eq!(
            detect_kind(Some("image/png"), "https://x/a.png", &png(12, 12, WHITE)),
            SourceKind::Raster
        );
        assert_eq!(detect_kind(None, "https://x/file.PDF?sig=1", b"??"), SourceKind::Document);
    }

    const BADGE: &str = r##"<svg xmlns="http://www.w3.org/2000/svg" width="20" height="10"><rect width="20" height="10" fill="#0000ff"/></svg>"##;

    #[test]
    fn detects_svg_markup_and_hints() {
        let prolog = format!("\u{feff}  <?xml version=\"1.0\"?>\n{}", BADGE);
        assert_eq!(detect_kind(None, "https://x/a", BADGE.as_bytes()), SourceKind::Vector);
        assert_eq!(detect_kind(Some("text/plain"), "https://x/a", prolog.as_bytes()), SourceKind::Vector);
        assert_eq!(
            detect_kind(Some("image/svg+xml; charset=utf-8"), "https://x/a", b"??"),
            SourceKind::Vector
        );
        assert_eq!(detect_kind(None, "https://x/logo.svg?v=2", b"??"), SourceKind::Vector);
        assert_eq!(detect_kind(None, "https://x/a", b"<?xml version=\"1.0\"?><feed/>"), SourceKind::Raster);
    }

    #[test]
    fn svg_is_rendered_to_cover_the_canvas() {
        let img = rasterize_svg(BADGE.as_bytes(), SQUARE).unwrap();
        assert_eq!(img.dimensions(), (800, 400));
        assert_eq!(img.get_pixel(400, 200), Rgba([0, 0, 255, 255]));

        let (webp, warnings) = transcode(BADGE.as_bytes(), SourceKind::Vector, Fit::Inside, SQUARE).unwrap();
        assert!(warnings.is_empty());
        let out = image::load_from_memory(&webp).unwrap();
        assert_eq!(out.dimensions(), (400, 400));
        let center = out.get_pixel(200, 200);
        assert!(center[2] > 200 && center[0] < 40, "badge body is blue");
        let corner = out.get_pixel(5, 5);
        assert!(corner[0] > 240 && corner[2] > 240, "letterbox is white");
    }

    #[test]
    fn broken_svg_is_a_vector_error() {
        let err = rasterize_svg(b"<svg", SQUARE).unwrap_err();
        assert!(matches!(err, MediaError::Vector(_)));
        assert_eq!(err.reason(), "vector");
    }

    #[test]
    fn rejects_tiny_and_huge() {
        let tiny = decode(&png(5, 50, WHITE)).unwrap();
        assert!(matches!(validate(&tiny), Err(MediaError::Dimensions { .. })));
        let wide = decode(&png(400, 100, WHITE)).unwrap();
        assert_eq!(validate(&wide).unwrap().len(), 1);
    }

    #[test]
    fn inside_fit_never_upscales() {
        let small = decode(&png(100, 50, Rgba([255, 0, 0, 255]))).unwrap();
        let out = compose(&small, Fit::Inside, SQUARE, false);
        assert_eq!(out.dimensions(), (400, 400));
        // Red only in the centered 100x50 block, white elsewhere.
        assert_eq!(out.get_pixel(200, 200), &Rgba([255, 0, 0, 255]));
        assert_eq!(out.get_pixel(10, 10), &WHITE);
    }

    #[test]
    fn cover_crops_from_the_top() {
        let mut tall = RgbaImage::from_pixel(800, 1600, Rgba([0, 0, 255, 255]));
        for x in 0..800 {
            for y in 0..40 {
                tall.put_pixel(x, y, Rgba([0, 255, 0, 255]));
            }
        }
        let out = compose(&DynamicImage::ImageRgba8(tall), Fit::CoverTop, SQUARE, false);
        assert_eq!(out.dimensions(), (400, 400));
        assert_eq!(out.get_pixel(200, 5), &Rgba([0, 255, 0, 255]));
        assert_eq!(out.get_pixel(200, 399), &Rgba([0, 0, 255, 255]));
    }

    #[test]
    fn icon_profile_keeps_transparency() {
        let img = decode(&png(20, 20, Rgba([10, 20, 30, 255]))).unwrap();
        let out = compose(&img, Fit::Inside, SQUARE, true);
        assert_eq!(out.get_pixel(0, 0)[3], 0);
        assert_eq!(SourceKind::Icon.profile().quality, 90.0);
    }

    #[test]
    fn placeholder_has_canvas_size() {
        let bytes = placeholder(SQUARE);
        let img = image::load_from_memory(&bytes).unwrap();
        assert_eq!(img.dimensions(), (400, 400));
    }
}
