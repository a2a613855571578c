use std::{
    collections::VecDeque,
    sync::atomic::{AtomicU64, Ordering},
    sync::Arc,
    time::{Duration, Instant, SystemTime},
};

use axum::body::Bytes;
use image::GenericImageView;
use parking_lot::Mutex;
use sha2::{Digest, Sha256};
use tracing::{debug, error, info};

use crate::metrics::{
    Timer, CACHE_HITS, CACHE_MISSES, COMPOSE_TIME, MEMES_COMPOSED, MEMES_SAVED, MEMES_SHARED,
    SAVE_FAILURES, TOTAL_MEMES,
};
use crate::models::meme::{Meme, MemeText, SavedMeme};
use crate::services::composer::MemeComposer;
use crate::services::library::{encode_png, MemeLibrary};
use crate::utils::error::{AppError, Result};

const REQUEST_HISTORY_WINDOW: Duration = Duration::from_secs(60 * 15);
const ONE_MINUTE: Duration = Duration::from_secs(60);
const FIVE_MINUTES: Duration = Duration::from_secs(60 * 5);
const FIFTEEN_MINUTES: Duration = Duration::from_secs(60 * 15);

/// 分享的结果：PNG 内容，以及分享完成后保存的条目
#[derive(Debug)]
pub struct SharedMeme {
    pub png: Bytes,
    pub saved: Option<SavedMeme>,
}

/// 编辑器流程：合成 → 预览 / 保存 / 分享
#[derive(Debug)]
pub struct MemeService {
    composer: Arc<MemeComposer>,
    library: Arc<MemeLibrary>,
    render_cache: moka::future::Cache<String, Bytes>,
    request_count: AtomicU64,
    cache_hits: AtomicU64,
    cache_misses: AtomicU64,
    memes_composed: AtomicU64,
    memes_saved: AtomicU64,
    save_failures: AtomicU64,
    start_time: SystemTime,
    request_timestamps: Mutex<VecDeque<Instant>>,
}

impl MemeService {
    pub fn new(
        composer: Arc<MemeComposer>,
        library: Arc<MemeLibrary>,
        max_size: u64,
        ttl_secs: u64,
    ) -> Self {
        let render_cache = moka::future::Cache::builder()
            .max_capacity(max_size)
            .time_to_live(Duration::from_secs(ttl_secs))
            .build();

        TOTAL_MEMES.set(library.count() as f64);

        Self {
            composer,
            library,
            render_cache,
            request_count: AtomicU64::new(0),
            cache_hits: AtomicU64::new(0),
            cache_misses: AtomicU64::new(0),
            memes_composed: AtomicU64::new(0),
            memes_saved: AtomicU64::new(0),
            save_failures: AtomicU64::new(0),
            start_time: SystemTime::now(),
            request_timestamps: Mutex::new(VecDeque::with_capacity(1000)),
        }
    }

    pub fn library(&self) -> &Arc<MemeLibrary> {
        &self.library
    }

    /// 未填写的行使用编辑器的占位文字
    pub fn meme_text(&self, top: Option<String>, bottom: Option<String>) -> MemeText {
        let config = self.composer.config();
        MemeText::new(
            top.unwrap_or_else(|| config.default_top_text.clone()),
            bottom.unwrap_or_else(|| config.default_bottom_text.clone()),
        )
    }

    /// 解码并合成，CPU 密集部分在阻塞线程池执行
    pub async fn compose(&self, image: Bytes, text: MemeText) -> Result<Meme> {
        self.record_request();
        self.validate_text(&text)?;

        let composer = Arc::clone(&self.composer);
        let meme = tokio::task::spawn_blocking(move || {
            let _timer = Timer::new(&COMPOSE_TIME);
            let original = composer.decode(&image)?;
            composer.compose(Arc::new(original), &text)
        })
        .await
        .map_err(|e| AppError::Internal(format!("Compose task failed: {}", e)))??;

        self.memes_composed.fetch_add(1, Ordering::Relaxed);
        MEMES_COMPOSED.inc();
        let (original_width, original_height) = meme.original_image().dimensions();
        debug!(
            original_width,
            original_height,
            top = meme.top_text(),
            bottom = meme.bottom_text(),
            width = meme.memed_image().width(),
            height = meme.memed_image().height(),
            "表情包合成完成"
        );
        Ok(meme)
    }

    /// 合成并编码为 PNG，相同输入命中渲染缓存
    pub async fn preview(&self, image: Bytes, text: MemeText) -> Result<Bytes> {
        let key = render_key(&image, &text);
        if let Some(png) = self.render_cache.get(&key).await {
            self.record_request();
            self.cache_hits.fetch_add(1, Ordering::Relaxed);
            CACHE_HITS.inc();
            debug!("Render cache hit");
            return Ok(png);
        }

        self.cache_misses.fetch_add(1, Ordering::Relaxed);
        CACHE_MISSES.inc();
        let meme = self.compose(image, text).await?;
        let png = Bytes::from(encode_meme(meme).await?);
        self.render_cache.insert(key, png.clone()).await;
        Ok(png)
    }

    /// 合成后保存到表情包库
    pub async fn save(&self, image: Bytes, text: MemeText) -> Result<SavedMeme> {
        let meme = self.compose(image, text).await?;
        let result = self.library.save(&meme).await;
        self.report_save(&result);
        result
    }

    /// 分享合成结果；分享完成且要求保存时同时存入表情包库，保存失败只记录日志
    pub async fn share(&self, image: Bytes, text: MemeText, save: bool) -> Result<SharedMeme> {
        let meme = self.compose(image, text).await?;
        let png = Bytes::from(encode_meme(meme).await?);
        MEMES_SHARED.inc();

        let saved = if save {
            let result = self.library.save_encoded(png.to_vec()).await;
            self.report_save(&result);
            result.ok()
        } else {
            None
        };

        Ok(SharedMeme { png, saved })
    }

    fn report_save(&self, result: &Result<SavedMeme>) {
        match result {
            Ok(saved) => {
                self.memes_saved.fetch_add(1, Ordering::Relaxed);
                MEMES_SAVED.inc();
                TOTAL_MEMES.set(self.library.count() as f64);
                info!(meme_id = %saved.id, file = %saved.filename, "表情包保存成功");
            }
            Err(e) => {
                self.save_failures.fetch_add(1, Ordering::Relaxed);
                SAVE_FAILURES.inc();
                error!("保存表情包失败: {}", e);
            }
        }
    }

    fn validate_text(&self, text: &MemeText) -> Result<()> {
        let max = self.composer.config().max_text_len;
        for (name, value) in [("top", &text.top), ("bottom", &text.bottom)] {
            if value.chars().count() > max {
                return Err(AppError::InvalidRequest(format!(
                    "{} text exceeds {} characters",
                    name, max
                )));
            }
        }
        Ok(())
    }

    pub fn get_request_count(&self) -> u64 {
        self.request_count.load(Ordering::Relaxed)
    }

    pub fn get_start_time(&self) -> SystemTime {
        self.start_time
    }

    pub fn get_cache_stats(&self) -> (u64, u64) {
        let hits = self.cache_hits.load(Ordering::Relaxed);
        let misses = self.cache_misses.load(Ordering::Relaxed);
        (hits, misses)
    }

    /// (合成数, 保存数, 保存失败数)
    pub fn get_meme_counters(&self) -> (u64, u64, u64) {
        (
            self.memes_composed.load(Ordering::Relaxed),
            self.memes_saved.load(Ordering::Relaxed),
            self.save_failures.load(Ordering::Relaxed),
        )
    }

    fn record_request(&self) {
        self.request_count.fetch_add(1, Ordering::Relaxed);

        let mut timestamps = self.request_timestamps.lock();
        let now = Instant::now();
        prune(&mut timestamps, now);
        timestamps.push_back(now);
    }

    pub fn get_requests_in_window(&self, window: Duration) -> u64 {
        let now = Instant::now();
        let mut timestamps = self.request_timestamps.lock();
        prune(&mut timestamps, now);

        timestamps
            .iter()
            .filter(|&timestamp| now.duration_since(*timestamp) <= window)
            .count() as u64
    }

    pub fn get_requests_last_minute(&self) -> u64 {
        self.get_requests_in_window(ONE_MINUTE)
    }

    pub fn get_requests_last_5_minutes(&self) -> u64 {
        self.get_requests_in_window(FIVE_MINUTES)
    }

    pub fn get_requests_last_15_minutes(&self) -> u64 {
        self.get_requests_in_window(FIFTEEN_MINUTES)
    }
}

// 移除超出统计窗口的时间戳
fn prune(timestamps: &mut VecDeque<Instant>, now: Instant) {
    while timestamps
        .front()
        .map(|&t| now.duration_since(t) > REQUEST_HISTORY_WINDOW)
        .unwrap_or(false)
    {
        timestamps.pop_front();
    }
}

async fn encode_meme(meme: Meme) -> Result<Vec<u8>> {
    tokio::task::spawn_blocking(move || encode_png(meme.memed_image()))
        .await
        .map_err(|e| AppError::Internal(format!("PNG encoding task failed: {}", e)))?
}

fn render_key(image: &[u8], text: &MemeText) -> String {
    let mut hasher = Sha256::new();
    hasher.update(image);
    hasher.update([0u8]);
    hasher.update(text.top.as_bytes());
    hasher.update([0u8]);
    hasher.update(text.bottom.as_bytes());
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ComposeConfig;
    use image::{DynamicImage, Rgba, RgbaImage};
    use std::io::Cursor;

    fn png(width: u32, height: u32) -> Bytes {
        let image = DynamicImage::ImageRgba8(RgbaImage::from_pixel(
            width,
            height,
            Rgba([200, 30, 30, 255]),
        ));
        let mut buf = Vec::new();
        image
            .write_to(&mut Cursor::new(&mut buf), image::ImageFormat::Png)
            .unwrap();
        Bytes::from(buf)
    }

    async fn service(dir: &std::path::Path) -> MemeService {
        let config = ComposeConfig {
            max_text_len: 10,
            ..ComposeConfig::default()
        };
        let composer = Arc::new(MemeComposer::new(&config));
        let library = MemeLibrary::new(dir, 16, 60, false).await.unwrap();
        MemeService::new(composer, library, 16, 60)
    }

    #[tokio::test]
    async fn compose_builds_meme_from_upload() {
        let dir = tempfile::tempdir().unwrap();
        let service = service(dir.path()).await;

        let meme = service
            .compose(png(64, 48), MemeText::new("hi", "there"))
            .await
            .unwrap();
        assert_eq!(meme.top_text(), "HI");
        assert_eq!(meme.bottom_text(), "THERE");
        assert_eq!(meme.memed_image().dimensions(), (64, 48));
        assert_eq!(service.get_request_count(), 1);
        assert_eq!(service.get_requests_last_minute(), 1);
    }

    #[tokio::test]
    async fn compose_rejects_bad_input() {
        let dir = tempfile::tempdir().unwrap();
        let service = service(dir.path()).await;

        let err = service
            .compose(Bytes::from_static(b"nope"), MemeText::new("a", "b"))
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::ImageDecode(_)));

        let err = service
            .compose(png(8, 8), MemeText::new("way too long text", ""))
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::InvalidRequest(_)));
    }

    #[tokio::test]
    async fn preview_hits_render_cache_on_repeat() {
        let dir = tempfile::tempdir().unwrap();
        let service = service(dir.path()).await;

        let first = service
            .preview(png(32, 32), MemeText::new("a", "b"))
            .await
            .unwrap();
        let second = service
            .preview(png(32, 32), MemeText::new("a", "b"))
            .await
            .unwrap();
        assert_eq!(first, second);
        assert_eq!(service.get_cache_stats(), (1, 1));

        let decoded = image::load_from_memory(&first).unwrap();
        assert_eq!(decoded.dimensions(), (32, 32));
    }

    #[tokio::test]
    async fn save_persists_into_library() {
        let dir = tempfile::tempdir().unwrap();
        let service = service(dir.path()).await;

        let saved = service
            .save(png(16, 16), MemeText::new("x", "y"))
            .await
            .unwrap();
        assert_eq!(service.library().count(), 1);
        assert!(dir.path().join(&saved.filename).is_file());
        assert_eq!(service.get_meme_counters(), (1, 1, 0));
    }

    #[tokio::test]
    async fn share_saves_only_when_asked() {
        let dir = tempfile::tempdir().unwrap();
        let service = service(dir.path()).await;

        let shared = service
            .share(png(16, 16), MemeText::new("x", ""), false)
            .await
            .unwrap();
        assert!(shared.saved.is_none());
        assert_eq!(service.library().count(), 0);
        assert!(image::load_from_memory(&shared.png).is_ok());

        let shared = service
            .share(png(16, 16), MemeText::new("x", ""), true)
            .await
            .unwrap();
        let saved = shared.saved.unwrap();
        assert_eq!(saved.size_bytes, shared.png.len() as u64);
        assert_eq!(service.library().count(), 1);
    }

    #[test]
    fn render_key_depends_on_every_input() {
        let text = MemeText::new("a", "b");
        let key = render_key(b"img", &text);
        assert_eq!(key.len(), 64);
        assert_eq!(key, render_key(b"img", &text));
        assert_ne!(key, render_key(b"img2", &text));
        assert_ne!(key, render_key(b"img", &MemeText::new("ab", "")));
    }
}
