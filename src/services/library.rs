use std::{
    collections::HashMap,
    io::Cursor,
    path::{Path, PathBuf},
    sync::{Arc, Weak},
    time::{Duration, SystemTime},
};

use axum::body::Bytes;
use image::{imageops::FilterType, GenericImageView, ImageFormat};
use notify::{RecursiveMode, Watcher};
use parking_lot::{Mutex, RwLock};
use sha2::{Digest, Sha256};
use time::{format_description::well_known::Rfc3339, OffsetDateTime};
use tokio::{
    sync::broadcast::{self, error::RecvError},
    task::JoinHandle,
};
use tracing::{debug, error, info, warn};

use crate::models::meme::{Meme, SavedMeme};
use crate::utils::error::{AppError, Result};

const RELOAD_DEBOUNCE: Duration = Duration::from_millis(250);
const ID_LEN: usize = 16;

// 缩放缓存键：ID + 请求的宽高
type ResizeKey = (String, Option<u32>, Option<u32>);

/// 表情包库：保存合成结果的目录
pub struct MemeLibrary {
    dir: PathBuf,
    index: RwLock<HashMap<String, SavedMeme>>,
    content_cache: moka::future::Cache<String, Bytes>,
    resized_cache: moka::future::Cache<ResizeKey, Bytes>,
    reload_tx: broadcast::Sender<()>,
    watcher: Mutex<Option<notify::RecommendedWatcher>>,
    last_updated: Mutex<SystemTime>,
}

impl std::fmt::Debug for MemeLibrary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemeLibrary")
            .field("dir", &self.dir)
            .field("memes", &self.index.read().len())
            .finish()
    }
}

impl MemeLibrary {
    pub async fn new(
        dir: impl Into<PathBuf>,
        max_size: u64,
        ttl_secs: u64,
        watch: bool,
    ) -> Result<Arc<Self>> {
        let dir = dir.into();
        tokio::fs::create_dir_all(&dir).await?;
        let (reload_tx, _) = broadcast::channel(16);

        let content_cache = moka::future::Cache::builder()
            .max_capacity(max_size)
            .time_to_live(Duration::from_secs(ttl_secs))
            .build();
        let resized_cache = moka::future::Cache::builder()
            .max_capacity(max_size)
            .time_to_live(Duration::from_secs(ttl_secs))
            .build();

        let library = Arc::new(Self {
            dir,
            index: RwLock::new(HashMap::new()),
            content_cache,
            resized_cache,
            reload_tx,
            watcher: Mutex::new(None),
            last_updated: Mutex::new(SystemTime::now()),
        });

        library.reload().await?;

        if watch {
            library.start_watching()?;
        }

        Ok(library)
    }

    fn start_watching(self: &Arc<Self>) -> Result<()> {
        let reload_tx = self.reload_tx.clone();
        let mut watcher = notify::recommended_watcher(move |res: notify::Result<notify::Event>| {
            match res {
                Ok(event) => {
                    // 忽略保存时产生的临时文件
                    if event.paths.iter().all(|p| is_hidden(p)) {
                        return;
                    }
                    for path in &event.paths {
                        debug!("检测到文件变更: {}", path.display());
                    }
                    // 没有订阅者时发送失败，可以忽略
                    let _ = reload_tx.send(());
                }
                Err(e) => error!("监控文件出错: {}", e),
            }
        })?;

        watcher.watch(&self.dir, RecursiveMode::NonRecursive)?;
        info!("开始监控目录: {:?}", self.dir);
        *self.watcher.lock() = Some(watcher);

        Self::start_reload_listener(Arc::downgrade(self), self.reload_tx.subscribe());
        Ok(())
    }

    fn start_reload_listener(
        library: Weak<Self>,
        mut rx: broadcast::Receiver<()>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(()) | Err(RecvError::Lagged(_)) => {}
                    Err(RecvError::Closed) => break,
                }

                // 合并短时间内的多次变更
                tokio::time::sleep(RELOAD_DEBOUNCE).await;
                while rx.try_recv().is_ok() {}

                let Some(library) = library.upgrade() else {
                    break;
                };
                info!("正在重新加载表情包库...");
                if let Err(e) = library.reload().await {
                    error!("重新加载表情包库失败: {}", e);
                }
            }
        })
    }

    /// 重新扫描目录，重建索引
    pub async fn reload(&self) -> Result<()> {
        let scan_started = OffsetDateTime::now_utc();
        let mut snapshot = HashMap::new();

        let mut entries = tokio::fs::read_dir(&self.dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if is_hidden(&path) {
                continue;
            }

            let mime = mime_guess::from_path(&path).first_or_octet_stream();
            if mime.type_() != mime_guess::mime::IMAGE {
                continue;
            }

            let Some(id) = path.file_stem().and_then(|s| s.to_str()).map(str::to_string) else {
                continue;
            };
            let filename = path
                .file_name()
                .and_then(|name| name.to_str())
                .unwrap_or("unknown")
                .to_string();

            // 扫描期间文件可能已被删除
            let metadata = match tokio::fs::metadata(&path).await {
                Ok(metadata) => metadata,
                Err(e) => {
                    warn!("跳过无法读取的文件 {}: {}", path.display(), e);
                    continue;
                }
            };
            if !metadata.is_file() {
                continue;
            }
            let created = metadata
                .created()
                .or_else(|_| metadata.modified())
                .unwrap_or_else(|_| SystemTime::now());

            snapshot.insert(
                id.clone(),
                SavedMeme {
                    id,
                    filename,
                    mime_type: mime.to_string(),
                    size_bytes: metadata.len(),
                    created_at: OffsetDateTime::from(created),
                },
            );
        }

        let count = {
            let mut index = self.index.write();
            let current = std::mem::take(&mut *index);
            *index = merge_rescan(current, snapshot, scan_started);
            index.len()
        };
        self.content_cache.invalidate_all();
        self.resized_cache.invalidate_all();
        *self.last_updated.lock() = SystemTime::now();

        info!("表情包库加载了 {} 个表情包", count);
        Ok(())
    }

    /// 保存合成后的表情包，同一张图重复保存返回已有条目
    pub async fn save(&self, meme: &Meme) -> Result<SavedMeme> {
        let image = meme.memed_image().clone();
        let png = tokio::task::spawn_blocking(move || encode_png(&image))
            .await
            .map_err(|e| AppError::Internal(format!("PNG encoding task failed: {}", e)))??;
        self.save_encoded(png).await
    }

    /// 保存已编码的 PNG
    pub async fn save_encoded(&self, png: Vec<u8>) -> Result<SavedMeme> {
        let id = content_id(&png);
        let existing = self.index.read().get(&id).cloned();
        if let Some(existing) = existing {
            debug!(meme_id = %id, "表情包已存在");
            return Ok(existing);
        }

        let filename = format!("{}.png", id);
        let path = self.dir.join(&filename);
        let tmp_path = self.dir.join(format!(".{}.tmp", filename));

        tokio::fs::write(&tmp_path, &png).await?;
        if let Err(e) = tokio::fs::rename(&tmp_path, &path).await {
            let _ = tokio::fs::remove_file(&tmp_path).await;
            return Err(e.into());
        }

        let saved = SavedMeme {
            id: id.clone(),
            filename,
            mime_type: "image/png".to_string(),
            size_bytes: png.len() as u64,
            created_at: OffsetDateTime::now_utc(),
        };

        self.index.write().insert(id.clone(), saved.clone());
        self.content_cache.insert(id, Bytes::from(png)).await;
        *self.last_updated.lock() = SystemTime::now();

        Ok(saved)
    }

    pub async fn get(&self, id: &str) -> Result<(SavedMeme, Bytes)> {
        let meme = self.entry(id)?;

        if let Some(content) = self.content_cache.get(id).await {
            debug!("Cache hit for meme {}", id);
            return Ok((meme, content));
        }

        debug!("Cache miss for meme {}, reading from disk", id);
        let content = match tokio::fs::read(self.dir.join(&meme.filename)).await {
            Ok(content) => Bytes::from(content),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                self.index.write().remove(id);
                return Err(AppError::MemeNotFound { id: id.to_string() });
            }
            Err(e) => return Err(e.into()),
        };
        self.content_cache
            .insert(id.to_string(), content.clone())
            .await;

        Ok((meme, content))
    }

    /// 等比缩放到给定宽高以内，输出 PNG
    pub async fn get_resized(
        &self,
        id: &str,
        width: Option<u32>,
        height: Option<u32>,
    ) -> Result<(SavedMeme, Bytes)> {
        if width.is_none() && height.is_none() {
            return self.get(id).await;
        }
        if width == Some(0) || height == Some(0) {
            return Err(AppError::InvalidRequest(
                "width and height must be greater than 0".to_string(),
            ));
        }

        let cache_key = (id.to_string(), width, height);
        let (meme, content) = self.get(id).await?;

        if let Some(resized) = self.resized_cache.get(&cache_key).await {
            return Ok((meme, resized));
        }

        let resized = tokio::task::spawn_blocking(move || -> Result<Vec<u8>> {
            let image = image::load_from_memory(&content)?;
            // 只缩小，不放大
            let (orig_w, orig_h) = image.dimensions();
            let target_w = width.unwrap_or(orig_w).min(orig_w);
            let target_h = height.unwrap_or(orig_h).min(orig_h);
            let resized = image.resize(target_w, target_h, FilterType::Lanczos3);
            encode_png(&resized.to_rgba8())
        })
        .await
        .map_err(|e| AppError::Internal(format!("Resize task failed: {}", e)))??;

        let resized = Bytes::from(resized);
        self.resized_cache
            .insert(cache_key, resized.clone())
            .await;

        let meme = SavedMeme {
            mime_type: "image/png".to_string(),
            size_bytes: resized.len() as u64,
            ..meme
        };
        Ok((meme, resized))
    }

    pub fn list(&self) -> Vec<SavedMeme> {
        let mut memes: Vec<SavedMeme> = self.index.read().values().cloned().collect();
        memes.sort_by(|a, b| {
            a.created_at
                .cmp(&b.created_at)
                .then_with(|| a.id.cmp(&b.id))
        });
        memes
    }

    pub fn count(&self) -> usize {
        self.index.read().len()
    }

    pub fn last_updated(&self) -> SystemTime {
        *self.last_updated.lock()
    }

    fn entry(&self, id: &str) -> Result<SavedMeme> {
        self.index
            .read()
            .get(id)
            .cloned()
            .ok_or_else(|| AppError::MemeNotFound { id: id.to_string() })
    }
}

pub fn encode_png(image: &image::RgbaImage) -> Result<Vec<u8>> {
    let mut buf = Vec::new();
    image.write_to(&mut Cursor::new(&mut buf), ImageFormat::Png)?;
    Ok(buf)
}

fn content_id(bytes: &[u8]) -> String {
    let digest = Sha256::digest(bytes);
    hex::encode(&digest[..ID_LEN / 2])
}

/// 用扫描快照替换索引，保留扫描开始后才保存的条目
fn merge_rescan(
    current: HashMap<String, SavedMeme>,
    mut snapshot: HashMap<String, SavedMeme>,
    scan_started: OffsetDateTime,
) -> HashMap<String, SavedMeme> {
    for (id, meme) in current {
        if meme.created_at >= scan_started {
            snapshot.entry(id).or_insert(meme);
        }
    }
    snapshot
}

fn is_hidden(path: &Path) -> bool {
    path.file_name()
        .and_then(|name| name.to_str())
        .map(|name| name.starts_with('.'))
        .unwrap_or(false)
}

pub fn format_time(time: SystemTime) -> String {
    OffsetDateTime::from(time)
        .format(&Rfc3339)
        .unwrap_or_else(|_| "unknown".to_string())
}
