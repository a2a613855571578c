use std::sync::Arc;

use image::{DynamicImage, RgbaImage};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use utoipa::ToSchema;

/// 合成后的表情包，创建后不可修改
#[derive(Debug, Clone)]
pub struct Meme {
    top_text: String,
    bottom_text: String,
    original_image: Arc<DynamicImage>,
    memed_image: Arc<RgbaImage>,
}

impl Meme {
    /// 只由合成器构造，保证 `memed_image` 是原图与两行文字的合成结果
    pub(crate) fn new(
        top_text: String,
        bottom_text: String,
        original_image: Arc<DynamicImage>,
        memed_image: RgbaImage,
    ) -> Self {
        Self {
            top_text,
            bottom_text,
            original_image,
            memed_image: Arc::new(memed_image),
        }
    }

    pub fn top_text(&self) -> &str {
        &self.top_text
    }

    pub fn bottom_text(&self) -> &str {
        &self.bottom_text
    }

    pub fn original_image(&self) -> &DynamicImage {
        &self.original_image
    }

    pub fn memed_image(&self) -> &RgbaImage {
        &self.memed_image
    }
}

/// 用户输入的上下两行文字
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemeText {
    pub top: String,
    pub bottom: String,
}

impl MemeText {
    pub fn new(top: impl Into<String>, bottom: impl Into<String>) -> Self {
        Self {
            top: top.into(),
            bottom: bottom.into(),
        }
    }

    /// 单行输入框：换行折叠为空格，可选全部大写
    pub fn normalized(&self, uppercase: bool) -> Self {
        let clean = |s: &str| {
            let single_line = s
                .split(['\r', '\n'])
                .filter(|part| !part.is_empty())
                .collect::<Vec<_>>()
                .join(" ");
            let trimmed = single_line.trim();
            if uppercase {
                trimmed.to_uppercase()
            } else {
                trimmed.to_string()
            }
        };

        Self {
            top: clean(&self.top),
            bottom: clean(&self.bottom),
        }
    }

    pub fn is_blank(&self) -> bool {
        self.top.is_empty() && self.bottom.is_empty()
    }
}

/// 表情包库中的条目
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct SavedMeme {
    #[schema(example = "3f2a9c0d41b7e855")]
    pub id: String,
    #[schema(example = "3f2a9c0d41b7e855.png")]
    pub filename: String,
    #[schema(example = "image/png")]
    pub mime_type: String,
    #[schema(example = 20480)]
    pub size_bytes: u64,
    #[serde(with = "time::serde::rfc3339")]
    #[schema(value_type = String, format = DateTime, example = "2026-10-19T08:30:00Z")]
    pub created_at: OffsetDateTime,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalized_collapses_lines_and_uppercases() {
        let text = MemeText::new("  one does not\nsimply ", "walk\r\ninto mordor");
        let normalized = text.normalized(true);
        assert_eq!(normalized.top, "ONE DOES NOT SIMPLY");
        assert_eq!(normalized.bottom, "WALK INTO MORDOR");
    }

    #[test]
    fn normalized_keeps_case_when_disabled() {
        let normalized = MemeText::new("Top", "").normalized(false);
        assert_eq!(normalized.top, "Top");
        assert_eq!(normalized.bottom, "");
        assert!(!normalized.is_blank());
        assert!(MemeText::new(" ", "\n").normalized(true).is_blank());
    }
}
