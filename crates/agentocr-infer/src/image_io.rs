use std::fs;
use std::path::{Path, PathBuf};

use image::RgbImage;

use crate::error::InferError;

const IMAGE_EXTENSIONS: &[&str] = &["jpg", "jpeg", "png", "bmp", "tif", "tiff", "gif", "webp"];

/// Decodes an image file into an 8-bit RGB buffer.
pub fn read_image(path: &Path) -> Result<RgbImage, InferError> {
    let image = image::open(path).map_err(|source| InferError::Image {
        path: path.to_path_buf(),
        source,
    })?;
    Ok(image.to_rgb8())
}

pub fn is_image_file(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| {
            IMAGE_EXTENSIONS
                .iter()
                .any(|known| known.eq_ignore_ascii_case(ext))
        })
}

/// Lists the images under `image_dir`, sorted by path.
///
/// A path pointing at a single image file yields just that file.
pub fn list_images(image_dir: &Path) -> Result<Vec<PathBuf>, InferError> {
    if image_dir.is_file() {
        if is_image_file(image_dir) {
            return Ok(vec![image_dir.to_path_buf()]);
        }
        return Err(InferError::invalid_input(format!(
            "{} is not a supported image file",
            image_dir.display()
        )));
    }

    let entries = fs::read_dir(image_dir).map_err(|err| InferError::io(image_dir, err))?;
    let mut files = Vec::new();
    for entry in entries {
        let entry = entry.map_err(|err| InferError::io(image_dir, err))?;
        let path = entry.path();
        if path.is_file() && is_image_file(&path) {
            files.push(path);
        }
    }
    if files.is_empty() {
        return Err(InferError::invalid_input(format!(
            "no images found in {}",
            image_dir.display()
        )));
    }
    files.sort();
    Ok(files)
}

/// Keeps every `total`-th file starting at `process_id`.
pub fn partition(files: Vec<PathBuf>, process_id: usize, total: usize) -> Vec<PathBuf> {
    let total = total.max(1);
    files
        .into_iter()
        .enumerate()
        .filter(|(index, _)| index % total == process_id)
        .map(|(_, path)| path)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn touch(dir: &Path, name: &str) -> PathBuf {
        let path = dir.join(name);
        fs::write(&path, b"").unwrap();
        path
    }

    #[test]
    fn list_images_filters_and_sorts() {
        let dir = tempfile::tempdir().unwrap();
        touch(dir.path(), "b.PNG");
        touch(dir.path(), "a.jpg");
        touch(dir.path(), "notes.txt");
        fs::create_dir(dir.path().join("nested.png")).unwrap();

        let files = list_images(dir.path()).unwrap();
        let names: Vec<_> = files
            .iter()
            .map(|p| p.file_name().unwrap().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec!["a.jpg", "b.PNG"]);
    }

    #[test]
    fn list_images_accepts_single_file() {
        let dir = tempfile::tempdir().unwrap();
        let file = touch(dir.path(), "only.webp");
        assert_eq!(list_images(&file).unwrap(), vec![file]);
    }

    #[test]
    fn list_images_reports_empty_and_missing_directories() {
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(
            list_images(dir.path()),
            Err(InferError::InvalidInput { .. })
        ));
        assert!(matches!(
            list_images(&dir.path().join("missing")),
            Err(InferError::Io { .. })
        ));
    }

    #[test]
    fn partition_strides_across_workers() {
        let files: Vec<PathBuf> = (0..7).map(|i| PathBuf::from(format!("{i}.png"))).collect();
        let first = partition(files.clone(), 0, 3);
        let second = partition(files.clone(), 1, 3);
        let third = partition(files.clone(), 2, 3);
        assert_eq!(first, vec![PathBuf::from("0.png"), "3.png".into(), "6.png".into()]);
        assert_eq!(second, vec![PathBuf::from("1.png"), "4.png".into()]);
        assert_eq!(third, vec![PathBuf::from("2.png"), "5.png".into()]);
        assert_eq!(partition(files.clone(), 0, 1), files);
    }
}
