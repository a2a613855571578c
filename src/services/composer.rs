use std::{fmt, fmt::Write as _, io::Cursor, sync::Arc};

use image::{imageops::FilterType, DynamicImage, GenericImageView, ImageDecoder, ImageReader, RgbaImage};
use resvg::tiny_skia;
use tracing::{debug, warn};
use usvg::fontdb;

use crate::config::ComposeConfig;
use crate::models::meme::{Meme, MemeText};
use crate::utils::error::{AppError, Result};

const TOP_LINE_ID: &str = "top";
const BOTTOM_LINE_ID: &str = "bottom";

// 单行文字最多占图片高度的比例
const MAX_LINE_HEIGHT_RATIO: f32 = 0.2;
// 左右留白，相对于图片宽度
const HORIZONTAL_PADDING_RATIO: f32 = 0.03;
// 基线相对字号的近似位置
const ASCENT_RATIO: f32 = 0.9;
const DESCENT_RATIO: f32 = 0.15;

const GENERIC_FAMILIES: [&str; 5] = ["serif", "sans-serif", "cursive", "fantasy", "monospace"];

/// 把两行文字烧录进图片像素
pub struct MemeComposer {
    config: ComposeConfig,
    fontdb: Arc<fontdb::Database>,
}

impl fmt::Debug for MemeComposer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemeComposer")
            .field("font_faces", &self.fontdb.len())
            .field("config", &self.config)
            .finish()
    }
}

#[derive(Debug, Clone, Copy)]
struct TextLine<'a> {
    id: &'static str,
    text: &'a str,
    baseline: f32,
    font_size: f32,
}

impl MemeComposer {
    pub fn new(config: &ComposeConfig) -> Self {
        let mut db = fontdb::Database::new();
        db.load_system_fonts();
        if let Some(dir) = &config.fonts_dir {
            db.load_fonts_dir(dir);
        }

        if db.is_empty() {
            warn!("没有找到可用字体，表情包文字将无法渲染");
        } else {
            debug!(faces = db.len(), "字体库加载完成");
        }

        Self {
            config: config.clone(),
            fontdb: Arc::new(db),
        }
    }

    pub fn font_face_count(&self) -> usize {
        self.fontdb.len()
    }

    pub fn config(&self) -> &ComposeConfig {
        &self.config
    }

    /// 解码上传的图片，按 EXIF 方向摆正，超过 `max_dimension` 时等比缩小
    pub fn decode(&self, bytes: &[u8]) -> Result<DynamicImage> {
        if bytes.is_empty() {
            return Err(AppError::InvalidRequest("Image body is empty".to_string()));
        }

        let image = decode_upright(bytes).map_err(|e| AppError::ImageDecode(e.to_string()))?;
        let (width, height) = image.dimensions();
        if width == 0 || height == 0 {
            return Err(AppError::ImageDecode("Image has no pixels".to_string()));
        }

        let max = self.config.max_dimension;
        if width > max || height > max {
            debug!(width, height, max, "缩小过大的图片");
            return Ok(image.resize(max, max, FilterType::Lanczos3));
        }

        Ok(image)
    }

    /// 合成表情包：原图 + 上下两行描边文字
    pub fn compose(&self, original: Arc<DynamicImage>, text: &MemeText) -> Result<Meme> {
        let text = text.normalized(self.config.uppercase);
        let mut canvas = original.to_rgba8();

        if !text.is_blank() {
            let (width, height) = canvas.dimensions();
            let (tree, _) = self.layout(width, height, &text)?;
            canvas = render_onto(&tree, canvas)?;
        }

        Ok(Meme::new(text.top, text.bottom, original, canvas))
    }

    /// 排版两行文字，过宽的行按测量结果缩小字号后重新排版
    fn layout(&self, width: u32, height: u32, text: &MemeText) -> Result<(usvg::Tree, [f32; 2])> {
        let (w, h) = (width as f32, height as f32);
        let base = self.base_font_size(w, h);
        let available = (w * (1.0 - 2.0 * HORIZONTAL_PADDING_RATIO)).max(1.0);

        let mut sizes = [base, base];
        let tree = self.parse(&self.overlay_svg(w, h, text, sizes))?;

        let mut refit = false;
        for (size, id) in sizes.iter_mut().zip([TOP_LINE_ID, BOTTOM_LINE_ID]) {
            if let Some(measured) = text_width(tree.root(), id) {
                if measured > available {
                    *size = (*size * available / measured).max(self.config.min_font_size);
                    refit = true;
                }
            }
        }

        if !refit {
            return Ok((tree, sizes));
        }

        debug!(top = sizes[0], bottom = sizes[1], "文字过宽，缩小字号");
        let tree = self.parse(&self.overlay_svg(w, h, text, sizes))?;
        Ok((tree, sizes))
    }

    fn base_font_size(&self, width: f32, height: f32) -> f32 {
        (width * self.config.font_scale)
            .min(height * MAX_LINE_HEIGHT_RATIO)
            .max(self.config.min_font_size)
    }

    fn parse(&self, svg: &str) -> Result<usvg::Tree> {
        let options = usvg::Options {
            fontdb: Arc::clone(&self.fontdb),
            font_resolver: font_resolver(),
            ..Default::default()
        };
        usvg::Tree::from_str(svg, &options).map_err(|e| AppError::Render(e.to_string()))
    }

    fn overlay_svg(&self, width: f32, height: f32, text: &MemeText, sizes: [f32; 2]) -> String {
        let margin = height * self.config.margin_ratio;
        let lines = [
            TextLine {
                id: TOP_LINE_ID,
                text: &text.top,
                baseline: margin + sizes[0] * ASCENT_RATIO,
                font_size: sizes[0],
            },
            TextLine {
                id: BOTTOM_LINE_ID,
                text: &text.bottom,
                baseline: height - margin - sizes[1] * DESCENT_RATIO,
                font_size: sizes[1],
            },
        ];

        let families = escape_xml(&self.font_family_list());
        let stroke = if self.config.stroke_width_percent > 0.0 {
            self.config.stroke_color.as_str()
        } else {
            "none"
        };

        let mut svg = format!(
            r#"<svg xmlns="http://www.w3.org/2000/svg" width="{width}" height="{height}" viewBox="0 0 {width} {height}">"#
        );
        for line in lines.iter().filter(|line| !line.text.is_empty()) {
            // 描边居中于轮廓，画在填充之下，所以可见宽度只有一半
            let stroke_width = line.font_size * self.config.stroke_width_percent / 100.0 * 2.0;
            let _ = write!(
                svg,
                r#"<text id="{id}" x="{x}" y="{y}" font-family="{families}" font-size="{size}" font-weight="{weight}" font-stretch="condensed" text-anchor="middle" fill="{fill}" stroke="{stroke}" stroke-width="{stroke_width}" stroke-linejoin="round" paint-order="stroke">{content}</text>"#,
                id = line.id,
                x = width / 2.0,
                y = line.baseline,
                size = line.font_size,
                weight = self.config.font_weight,
                fill = self.config.fill_color,
                content = escape_xml(line.text),
            );
        }
        svg.push_str("</svg>");
        svg
    }

    fn font_family_list(&self) -> String {
        self.config
            .font_families
            .iter()
            .map(|family| family.trim())
            .filter(|family| !family.is_empty())
            .map(|family| {
                if GENERIC_FAMILIES.contains(&family) {
                    family.to_string()
                } else {
                    format!("'{}'", family.replace(['\'', '"'], ""))
                }
            })
            .collect::<Vec<_>>()
            .join(", ")
    }
}

/// 相机拍摄的照片常以 EXIF 标记旋转，先摆正再排版文字
fn decode_upright(bytes: &[u8]) -> image::ImageResult<DynamicImage> {
    let mut decoder = ImageReader::new(Cursor::new(bytes))
        .with_guessed_format()?
        .into_decoder()?;
    let orientation = decoder.orientation()?;
    let mut image = DynamicImage::from_decoder(decoder)?;
    image.apply_orientation(orientation);
    Ok(image)
}

fn text_width(group: &usvg::Group, id: &str) -> Option<f32> {
    for node in group.children() {
        match node {
            usvg::Node::Text(text) if text.id() == id => {
                return Some(text.bounding_box().width());
            }
            usvg::Node::Group(g) => {
                if let Some(width) = text_width(g, id) {
                    return Some(width);
                }
            }
            _ => {}
        }
    }
    None
}

/// 在图片的预乘像素上直接渲染文字层，再还原为非预乘 RGBA
fn render_onto(tree: &usvg::Tree, canvas: RgbaImage) -> Result<RgbaImage> {
    let (width, height) = canvas.dimensions();
    let size = tiny_skia::IntSize::from_wh(width, height)
        .ok_or_else(|| AppError::Render(format!("invalid canvas size {width}x{height}")))?;

    let mut data = canvas.into_raw();
    premultiply_rgba8_in_place(&mut data);

    let mut pixmap = tiny_skia::Pixmap::from_vec(data, size)
        .ok_or_else(|| AppError::Render("failed to allocate pixmap".to_string()))?;
    resvg::render(tree, tiny_skia::Transform::identity(), &mut pixmap.as_mut());

    let mut data = pixmap.take();
    demultiply_rgba8_in_place(&mut data);
    RgbaImage::from_raw(width, height, data)
        .ok_or_else(|| AppError::Render("pixmap size mismatch".to_string()))
}

fn font_resolver() -> usvg::FontResolver<'static> {
    use usvg::FontResolver;

    FontResolver {
        select_font: Box::new(|font, db| {
            let mut families = Vec::<fontdb::Family<'_>>::new();
            for family in font.families() {
                families.push(match family {
                    usvg::FontFamily::Serif => fontdb::Family::Serif,
                    usvg::FontFamily::SansSerif => fontdb::Family::SansSerif,
                    usvg::FontFamily::Cursive => fontdb::Family::Cursive,
                    usvg::FontFamily::Fantasy => fontdb::Family::Fantasy,
                    usvg::FontFamily::Monospace => fontdb::Family::Monospace,
                    usvg::FontFamily::Named(s) => fontdb::Family::Name(s),
                });
            }
            families.push(fontdb::Family::SansSerif);

            let stretch = match font.stretch() {
                usvg::FontStretch::UltraCondensed => fontdb::Stretch::UltraCondensed,
                usvg::FontStretch::ExtraCondensed => fontdb::Stretch::ExtraCondensed,
                usvg::FontStretch::Condensed => fontdb::Stretch::Condensed,
                usvg::FontStretch::SemiCondensed => fontdb::Stretch::SemiCondensed,
                usvg::FontStretch::Normal => fontdb::Stretch::Normal,
                usvg::FontStretch::SemiExpanded => fontdb::Stretch::SemiExpanded,
                usvg::FontStretch::Expanded => fontdb::Stretch::Expanded,
                usvg::FontStretch::ExtraExpanded => fontdb::Stretch::ExtraExpanded,
                usvg::FontStretch::UltraExpanded => fontdb::Stretch::UltraExpanded,
            };

            let style = match font.style() {
                usvg::FontStyle::Normal => fontdb::Style::Normal,
                usvg::FontStyle::Italic => fontdb::Style::Italic,
                usvg::FontStyle::Oblique => fontdb::Style::Oblique,
            };

            let query = fontdb::Query {
                families: &families,
                weight: fontdb::Weight(font.weight()),
                stretch,
                style,
            };

            // 首选字体都不存在时退回任意可用字体
            db.query(&query)
                .or_else(|| db.faces().next().map(|face| face.id))
        }),
        select_fallback: FontResolver::default_fallback_selector(),
    }
}

pub(crate) fn escape_xml(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    for c in input.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&apos;"),
            c if c.is_control() => out.push(' '),
            c => out.push(c),
        }
    }
    out
}

fn premultiply_rgba8_in_place(rgba: &mut [u8]) {
    for px in rgba.chunks_exact_mut(4) {
        let a = px[3] as u16;
        if a == 255 {
            continue;
        }
        if a == 0 {
            px[0] = 0;
            px[1] = 0;
            px[2] = 0;
            continue;
        }
        px[0] = ((px[0] as u16 * a + 127) / 255) as u8;
        px[1] = ((px[1] as u16 * a + 127) / 255) as u8;
        px[2] = ((px[2] as u16 * a + 127) / 255) as u8;
    }
}

fn demultiply_rgba8_in_place(rgba: &mut [u8]) {
    for px in rgba.chunks_exact_mut(4) {
        let a = px[3] as u16;
        if a == 255 || a == 0 {
            continue;
        }
        px[0] = ((px[0] as u16 * 255 + a / 2) / a).min(255) as u8;
        px[1] = ((px[1] as u16 * 255 + a / 2) / a).min(255) as u8;
        px[2] = ((px[2] as u16 * 255 + a / 2) / a).min(255) as u8;
    }
}
