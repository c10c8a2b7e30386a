//! QR connection artifacts for the Metro bundler URL.
//!
//! [`generate_qr_code`] is a pure function: it never touches shared state and
//! reports every failure through [`QrArtifact::error`] instead of returning
//! an error, so callers can always fall back to showing the plain URL.

pub mod cache;

use std::fmt;
use std::io::Cursor;
use std::str::FromStr;

use base64::Engine;
use chrono::{DateTime, Utc};
use qrcode::{Color, EcLevel, QrCode};
use serde::{Deserialize, Serialize};

pub use cache::{CacheKey, MemoryQrCache, QrCacheStore};

pub const MIN_SIZE: u32 = 64;
pub const MAX_SIZE: u32 = 2048;
pub const MAX_MARGIN: u32 = 16;

const ALLOWED_SCHEMES: &[&str] = &["http", "https", "exp", "exps"];

// ---------------------------------------------------------------------------
// Options
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QrFormat {
    Svg,
    Png,
}

impl QrFormat {
    pub fn as_str(self) -> &'static str {
        match self {
            QrFormat::Svg => "svg",
            QrFormat::Png => "png",
        }
    }

    fn mime(self) -> &'static str {
        match self {
            QrFormat::Svg => "image/svg+xml",
            QrFormat::Png => "image/png",
        }
    }
}

impl fmt::Display for QrFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for QrFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "svg" => Ok(QrFormat::Svg),
            "png" => Ok(QrFormat::Png),
            other => Err(format!("unsupported QR format '{other}': expected svg or png")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorCorrection {
    L,
    M,
    Q,
    H,
}

impl ErrorCorrection {
    fn ec_level(self) -> EcLevel {
        match self {
            ErrorCorrection::L => EcLevel::L,
            ErrorCorrection::M => EcLevel::M,
            ErrorCorrection::Q => EcLevel::Q,
            ErrorCorrection::H => EcLevel::H,
        }
    }
}

impl FromStr for ErrorCorrection {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "L" => Ok(ErrorCorrection::L),
            "M" => Ok(ErrorCorrection::M),
            "Q" => Ok(ErrorCorrection::Q),
            "H" => Ok(ErrorCorrection::H),
            other => Err(format!(
                "unsupported error correction level '{other}': expected L, M, Q or H"
            )),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QrOptions {
    pub format: QrFormat,
    /// Output edge length in pixels.
    pub size: u32,
    pub error_correction: ErrorCorrection,
    /// Quiet zone, in modules.
    pub margin: u32,
    pub dark_color: String,
    pub light_color: String,
}

impl Default for QrOptions {
    fn default() -> Self {
        Self {
            format: QrFormat::Svg,
            size: 256,
            error_correction: ErrorCorrection::M,
            margin: 4,
            dark_color: "#000000".to_string(),
            light_color: "#ffffff".to_string(),
        }
    }
}

// ---------------------------------------------------------------------------
// Artifact
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QrArtifact {
    /// `data:` URL with the base64 payload; empty when `error` is set.
    pub data_url: String,
    /// Raw SVG document, only for the svg format.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub svg: Option<String>,
    /// The encoded bundler URL.
    pub url: String,
    pub format: QrFormat,
    pub size: u32,
    pub error_correction_level: ErrorCorrection,
    pub margin: u32,
    pub generated_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl QrArtifact {
    pub fn is_ok(&self) -> bool {
        self.error.is_none()
    }

    fn failed(url: &str, opts: &QrOptions, generated_at: DateTime<Utc>, error: String) -> Self {
        Self {
            data_url: String::new(),
            svg: None,
            url: url.to_string(),
            format: opts.format,
            size: opts.size,
            error_correction_level: opts.error_correction,
            margin: opts.margin,
            generated_at,
            error: Some(error),
        }
    }
}

// ---------------------------------------------------------------------------
// Generation
// ---------------------------------------------------------------------------

/// Render `url` as a QR code.
pub fn generate_qr_code(url: &str, opts: &QrOptions) -> QrArtifact {
    generate_at(url, opts, Utc::now())
}

/// As [`generate_qr_code`] with an explicit timestamp, so output is fully
/// reproducible.
pub fn generate_at(url: &str, opts: &QrOptions, generated_at: DateTime<Utc>) -> QrArtifact {
    match render(url, opts) {
        Ok((data_url, svg)) => QrArtifact {
            data_url,
            svg,
            url: url.to_string(),
            format: opts.format,
            size: opts.size,
            error_correction_level: opts.error_correction,
            margin: opts.margin,
            generated_at,
            error: None,
        },
        Err(e) => QrArtifact::failed(url, opts, generated_at, e),
    }
}

/// Accept only URLs a phone can open: http(s) or Expo's exp(s) with a host.
pub fn validate_url(raw: &str) -> Result<url::Url, String> {
    let parsed = url::Url::parse(raw).map_err(|e| format!("invalid URL '{raw}': {e}"))?;
    if !ALLOWED_SCHEMES.contains(&parsed.scheme()) {
        return Err(format!(
            "unsupported URL scheme '{}': expected http, https, exp or exps",
            parsed.scheme()
        ));
    }
    match parsed.host_str() {
        Some(h) if !h.is_empty() => Ok(parsed),
        _ => Err(format!("URL '{raw}' has no host")),
    }
}

fn render(url: &str, opts: &QrOptions) -> Result<(String, Option<String>), String> {
    validate_url(url)?;
    if !(MIN_SIZE..=MAX_SIZE).contains(&opts.size) {
        return Err(format!(
            "size {} out of range ({MIN_SIZE}..={MAX_SIZE})",
            opts.size
        ));
    }
    if opts.margin > MAX_MARGIN {
        return Err(format!("margin {} out of range (0..={MAX_MARGIN})", opts.margin));
    }
    let dark = parse_hex_color(&opts.dark_color)?;
    let light = parse_hex_color(&opts.light_color)?;

    let code = QrCode::with_error_correction_level(url.as_bytes(), opts.error_correction.ec_level())
        .map_err(|e| format!("QR encoding failed: {e}"))?;
    let grid = Grid::new(&code, opts.margin);
    if grid.modules > opts.size as usize {
        return Err(format!(
            "size {} too small for a {}-module code",
            opts.size, grid.modules
        ));
    }

    let b64 = base64::engine::general_purpose::STANDARD;
    match opts.format {
        QrFormat::Svg => {
            let svg = grid.to_svg(opts.size, &opts.dark_color, &opts.light_color);
            let data_url = format!("data:{};base64,{}", opts.format.mime(), b64.encode(&svg));
            Ok((data_url, Some(svg)))
        }
        QrFormat::Png => {
            let png = grid.to_png(opts.size, dark, light)?;
            let data_url = format!("data:{};base64,{}", opts.format.mime(), b64.encode(&png));
            Ok((data_url, None))
        }
    }
}

/// Module grid including the quiet zone.
struct Grid {
    modules: usize,
    dark: Vec<bool>,
}

impl Grid {
    fn new(code: &QrCode, margin: u32) -> Self {
        let width = code.width();
        let margin = margin as usize;
        let modules = width + 2 * margin;
        let mut dark = vec![false; modules * modules];
        for (i, color) in code.to_colors().into_iter().enumerate() {
            if color == Color::Dark {
                let (x, y) = (i % width + margin, i / width + margin);
                dark[y * modules + x] = true;
            }
        }
        Self { modules, dark }
    }

    fn is_dark(&self, x: usize, y: usize) -> bool {
        self.dark[y * self.modules + x]
    }

    fn to_svg(&self, size: u32, dark: &str, light: &str) -> String {
        let n = self.modules;
        let mut path = String::new();
        for y in 0..n {
            for x in 0..n {
                if self.is_dark(x, y) {
                    path.push_str(&format!("M{x} {y}h1v1h-1z"));
                }
            }
        }
        format!(
            concat!(
                r#"<?xml version="1.0" encoding="UTF-8"?>"#,
                r#"<svg xmlns="http://www.w3.org/2000/svg" version="1.1" "#,
                r#"width="{size}" height="{size}" viewBox="0 0 {n} {n}" shape-rendering="crispEdges">"#,
                r#"<rect width="{n}" height="{n}" fill="{light}"/>"#,
                r#"<path d="{path}" fill="{dark}"/>"#,
                "</svg>"
            ),
            size = size,
            n = n,
            light = light,
            dark = dark,
            path = path,
        )
    }

    /// Nearest-module sampling so the image is exactly `size` pixels wide.
    fn to_png(&self, size: u32, dark: [u8; 3], light: [u8; 3]) -> Result<Vec<u8>, String> {
        let n = self.modules;
        let px = size as usize;
        let img = image::RgbImage::from_fn(size, size, |x, y| {
            let mx = x as usize * n / px;
            let my = y as usize * n / px;
            image::Rgb(if self.is_dark(mx, my) { dark } else { light })
        });
        let mut buf = Vec::new();
        image::DynamicImage::ImageRgb8(img)
            .write_to(&mut Cursor::new(&mut buf), image::ImageFormat::Png)
            .map_err(|e| format!("PNG encoding failed: {e}"))?;
        Ok(buf)
    }
}

/// Parse `#rgb` or `#rrggbb`.
fn parse_hex_color(s: &str) -> Result<[u8; 3], String> {
    let invalid = || format!("invalid color '{s}': expected #rgb or #rrggbb");
    let hex = s.strip_prefix('#').ok_or_else(invalid)?;
    if !hex.chars().all(|c| c.is_ascii_hexdigit()) {
        return Err(invalid());
    }
    let channel = |h: &str| u8::from_str_radix(h, 16).map_err(|_| invalid());
    match hex.len() {
        3 => {
            let mut out = [0u8; 3];
            for (i, c) in hex.chars().enumerate() {
                let v = channel(&c.to_string())?;
                out[i] = v * 17;
            }
            Ok(out)
        }
        6 => Ok([
            channel(&hex[0..2])?,
            channel(&hex[2..4])?,
            channel(&hex[4..6])?,
        ]),
        _ => Err(invalid()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const METRO: &str = "https://mobile-abc123.up.railway.app";

    #[test]
    fn svg_artifact_is_complete_document() {
        let art = generate_qr_code(METRO, &QrOptions::default());
        assert!(art.is_ok(), "{:?}", art.error);
        let svg = art.svg.as_deref().unwrap();
        assert!(svg.contains("<svg"));
        assert!(svg.ends_with("</svg>"));
        assert!(svg.contains(r#"width="256""#));
        assert!(art.data_url.starts_with("data:image/svg+xml;base64,"));
        assert_eq!(art.url, METRO);
        assert_eq!(art.error_correction_level, ErrorCorrection::M);
    }

    #[test]
    fn png_artifact_has_png_signature() {
        let opts = QrOptions {
            format: QrFormat::Png,
            size: 128,
            ..QrOptions::default()
        };
        let art = generate_qr_code(METRO, &opts);
        assert!(art.is_ok(), "{:?}", art.error);
        assert!(art.svg.is_none());
        let payload = art.data_url.strip_prefix("data:image/png;base64,").unwrap();
        let bytes = base64::engine::general_purpose::STANDARD
            .decode(payload)
            .unwrap();
        assert_eq!(&bytes[..8], b"\x89PNG\r\n\x1a\n");
    }

    #[test]
    fn generation_is_deterministic() {
        let at = Utc::now();
        let a = generate_at(METRO, &QrOptions::default(), at);
        let b = generate_at(METRO, &QrOptions::default(), at);
        assert_eq!(a, b);
    }

    #[test]
    fn exp_scheme_accepted() {
        let art = generate_qr_code("exp://192.168.1.20:8081", &QrOptions::default());
        assert!(art.is_ok(), "{:?}", art.error);
    }

    #[test]
    fn malformed_url_sets_error() {
        for bad in ["not a url", "ftp://example.com", "file:///etc/passwd", ""] {
            let art = generate_qr_code(bad, &QrOptions::default());
            assert!(art.error.is_some(), "expected error for {bad:?}");
            assert!(art.data_url.is_empty());
            assert_eq!(art.url, bad);
        }
    }

    #[test]
    fn out_of_range_options_set_error() {
        let small = QrOptions {
            size: 10,
            ..QrOptions::default()
        };
        assert!(generate_qr_code(METRO, &small).error.is_some());

        let wide_margin = QrOptions {
            margin: 40,
            ..QrOptions::default()
        };
        assert!(generate_qr_code(METRO, &wide_margin).error.is_some());

        let bad_color = QrOptions {
            dark_color: "black".into(),
            ..QrOptions::default()
        };
        assert!(generate_qr_code(METRO, &bad_color).error.is_some());
    }

    #[test]
    fn oversized_payload_sets_error() {
        let url = format!("https://example.com/{}", "a".repeat(5000));
        let art = generate_qr_code(&url, &QrOptions::default());
        assert!(art.error.unwrap().contains("QR encoding failed"));
    }

    #[test]
    fn higher_error_correction_changes_output() {
        let at = Utc::now();
        let m = generate_at(METRO, &QrOptions::default(), at);
        let h = generate_at(
            METRO,
            &QrOptions {
                error_correction: ErrorCorrection::H,
                ..QrOptions::default()
            },
            at,
        );
        assert_ne!(m.data_url, h.data_url);
    }

    #[test]
    fn hex_colors_parse() {
        assert_eq!(parse_hex_color("#fff").unwrap(), [255, 255, 255]);
        assert_eq!(parse_hex_color("#1a2B3c").unwrap(), [0x1a, 0x2b, 0x3c]);
        assert!(parse_hex_color("123456").is_err());
        assert!(parse_hex_color("#12345").is_err());
        assert!(parse_hex_color("#gggggg").is_err());
    }

    #[test]
    fn options_parse_case_insensitively() {
        assert_eq!("PNG".parse::<QrFormat>().unwrap(), QrFormat::Png);
        assert_eq!("h".parse::<ErrorCorrection>().unwrap(), ErrorCorrection::H);
        assert!("gif".parse::<QrFormat>().is_err());
    }

    #[test]
    fn artifact_serializes_camel_case() {
        let art = generate_qr_code(METRO, &QrOptions::default());
        let json = serde_json::to_value(&art).unwrap();
        assert!(json.get("dataUrl").is_some());
        assert_eq!(json["errorCorrectionLevel"], "M");
        assert_eq!(json["format"], "svg");
        assert!(json.get("error").is_none());
    }
}
