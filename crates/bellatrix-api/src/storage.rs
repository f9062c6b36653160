use anyhow::{Result, bail};
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{info, warn};
use uuid::Uuid;

/// URL prefix under which stored images are served.
pub const PUBLIC_PREFIX: &str = "/uploads/";

const ALLOWED_IMAGE_TYPES: &[(&str, &str)] = &[
    ("image/jpeg", "jpg"),
    ("image/png", "png"),
    ("image/gif", "gif"),
    ("image/webp", "webp"),
];

/// File extension for an accepted image content type.
pub fn image_extension(content_type: &str) -> Option<&'static str> {
    ALLOWED_IMAGE_TYPES
        .iter()
        .find(|(mime, _)| mime.eq_ignore_ascii_case(content_type.trim()))
        .map(|(_, ext)| *ext)
}

pub fn allowed_image_types() -> String {
    ALLOWED_IMAGE_TYPES
        .iter()
        .map(|(mime, _)| *mime)
        .collect::<Vec<_>>()
        .join(", ")
}

/// Flat on-disk image store. Every file gets a fresh unique name; the public
/// path handed back is what the static file route serves.
pub struct Storage {
    dir: PathBuf,
}

impl Storage {
    pub async fn new(dir: PathBuf) -> Result<Self> {
        fs::create_dir_all(&dir).await?;
        info!("Upload directory: {}", dir.display());
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Write an image and return its public path (`/uploads/<name>`).
    pub async fn save(&self, extension: &str, data: &[u8]) -> Result<String> {
        let name = format!(
            "{}-{}.{}",
            chrono::Utc::now().timestamp_millis(),
            Uuid::new_v4().simple(),
            extension
        );
        let path = self.dir.join(&name);

        let mut file = fs::File::create(&path).await?;
        file.write_all(data).await?;
        file.flush().await?;

        Ok(format!("{}{}", PUBLIC_PREFIX, name))
    }

    /// Remove a stored image by its public path. A file that is already gone
    /// only logs a warning.
    pub async fn delete(&self, public_path: &str) -> Result<()> {
        let path = self.resolve(public_path)?;
        match fs::remove_file(&path).await {
            Ok(()) => {
                info!("Deleted stored image {}", path.display());
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                warn!("Stored image {} already gone", path.display());
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Map a public path back to a file inside the store, refusing anything
    /// that would escape the directory.
    fn resolve(&self, public_path: &str) -> Result<PathBuf> {
        let Some(name) = public_path.strip_prefix(PUBLIC_PREFIX) else {
            bail!("not an upload path: {}", public_path);
        };
        if name.is_empty() || name.contains(['/', '\\']) || name.starts_with('.') {
            bail!("invalid upload name: {}", public_path);
        }
        Ok(self.dir.join(name))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scratch_dir(tag: &str) -> PathBuf {
        std::env::temp_dir().join(format!("bellatrix-storage-{}-{}", tag, Uuid::new_v4()))
    }

    #[test]
    fn only_images_are_accepted() {
        assert_eq!(image_extension("image/png"), Some("png"));
        assert_eq!(image_extension("IMAGE/JPEG"), Some("jpg"));
        assert_eq!(image_extension("application/pdf"), None);
        assert_eq!(image_extension("text/html"), None);
    }

    #[tokio::test]
    async fn save_then_delete() {
        let dir = scratch_dir("roundtrip");
        let storage = Storage::new(dir.clone()).await.unwrap();

        let public = storage.save("png", b"not really a png").await.unwrap();
        assert!(public.starts_with(PUBLIC_PREFIX));
        assert!(public.ends_with(".png"));

        let on_disk = dir.join(public.trim_start_matches(PUBLIC_PREFIX));
        assert_eq!(std::fs::read(&on_disk).unwrap(), b"not really a png");

        storage.delete(&public).await.unwrap();
        assert!(!on_disk.exists());

        // Second delete is a no-op
        storage.delete(&public).await.unwrap();

        let _ = std::fs::remove_dir_all(dir);
    }

    #[tokio::test]
    async fn delete_refuses_paths_outside_the_store() {
        let dir = scratch_dir("escape");
        let storage = Storage::new(dir.clone()).await.unwrap();

        assert!(storage.delete("/uploads/../secret").await.is_err());
        assert!(storage.delete("/etc/passwd").await.is_err());
        assert!(storage.delete("/uploads/").await.is_err());

        let _ = std::fs::remove_dir_all(dir);
    }
}
