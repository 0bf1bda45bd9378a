use image::RgbImage;
use image::imageops::{self, FilterType};

use crate::args::{ImageShape, LimitType};

const DETECTION_ALIGN: u32 = 32;
pub const IMAGENET_MEAN: [f32; 3] = [0.485, 0.456, 0.406];
pub const IMAGENET_STD: [f32; 3] = [0.229, 0.224, 0.225];
const HALF: [f32; 3] = [0.5, 0.5, 0.5];

/// Dimensions the detector input is resized to, multiples of 32.
pub fn detection_size(width: u32, height: u32, limit_side_len: u32, limit: LimitType) -> (u32, u32) {
    let limit_side_len = limit_side_len.max(1) as f32;
    let (w, h) = (width.max(1) as f32, height.max(1) as f32);
    let ratio = match limit {
        LimitType::Max if w.max(h) > limit_side_len => limit_side_len / w.max(h),
        LimitType::Min if w.min(h) < limit_side_len => limit_side_len / w.min(h),
        _ => 1.0,
    };
    let align = |value: f32| {
        let aligned = ((value * ratio) / DETECTION_ALIGN as f32).round() as u32 * DETECTION_ALIGN;
        aligned.max(DETECTION_ALIGN)
    };
    (align(w), align(h))
}

/// Resizes for detection and lays the image out as normalized CHW floats.
pub fn detection_tensor(
    image: &RgbImage,
    limit_side_len: u32,
    limit: LimitType,
) -> (Vec<f32>, [usize; 4]) {
    let (width, height) = detection_size(image.width(), image.height(), limit_side_len, limit);
    let resized = if (width, height) == image.dimensions() {
        image.clone()
    } else {
        imageops::resize(image, width, height, FilterType::Triangle)
    };
    let data = normalize_chw(&resized, &IMAGENET_MEAN, &IMAGENET_STD, width, height);
    (data, [1, 3, height as usize, width as usize])
}

/// Writes `image` into a `width x height` CHW canvas, normalized per channel.
///
/// Pixels outside `image` stay zero.
pub fn normalize_chw(
    image: &RgbImage,
    mean: &[f32; 3],
    std: &[f32; 3],
    width: u32,
    height: u32,
) -> Vec<f32> {
    let area = (width * height) as usize;
    let mut data = vec![0.0f32; area * 3];
    let copy_w = image.width().min(width);
    let copy_h = image.height().min(height);
    for y in 0..copy_h {
        for x in 0..copy_w {
            let pixel = image.get_pixel(x, y);
            let offset = (y * width + x) as usize;
            for channel in 0..3 {
                let value = pixel[channel] as f32 / 255.0;
                data[channel * area + offset] = (value - mean[channel]) / std[channel];
            }
        }
    }
    data
}

/// Height-fitted resize that keeps the aspect ratio and pads on the right.
pub fn resize_padded(image: &RgbImage, shape: ImageShape) -> Vec<f32> {
    let (src_w, src_h) = image.dimensions();
    let target_h = shape.height;
    let target_w = shape.width;
    if src_w == 0 || src_h == 0 {
        return vec![0.0; (target_w * target_h * 3) as usize];
    }
    let ratio = src_w as f32 / src_h as f32;
    let scaled_w = ((target_h as f32 * ratio).ceil() as u32).clamp(1, target_w);
    let resized = imageops::resize(image, scaled_w, target_h, FilterType::Triangle);
    normalize_chw(&resized, &HALF, &HALF, target_w, target_h)
}

/// Stacks padded crops into one `[n, 3, h, w]` tensor.
pub fn batch_tensor(images: &[RgbImage], shape: ImageShape) -> (Vec<f32>, [usize; 4]) {
    let per_image = (shape.width * shape.height * 3) as usize;
    let mut data = Vec::with_capacity(per_image * images.len());
    for image in images {
        data.extend(resize_padded(image, shape));
    }
    (
        data,
        [
            images.len(),
            3,
            shape.height as usize,
            shape.width as usize,
        ],
    )
}
