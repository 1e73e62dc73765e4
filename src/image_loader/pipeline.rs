//! # 解码与缩放流水线模块
//!
//! ## 设计思路
//!
//! 将“字节 → 图像 → RGBA”的过程集中管理，并在关键节点增加资源上限控制。
//! 优先做签名与尺寸检查，再进行完整解码，降低恶意输入触发高内存开销的风险。
//!
//! ## 实现思路
//!
//! 1. 文件签名（magic bytes）识别，非图片直接拒绝
//! 2. 读取 header 尺寸，按像素上限快速拒绝
//! 3. 完整解码
//! 4. 按 `FitMode` 计算等比缩放尺寸并缩放（`fast_image_resize`，失败回退 `image`）
//! 5. 需要时居中贴到透明画布，统一输出 RGBA8

use std::io::Cursor;

use fast_image_resize as fr;
use image::{DynamicImage, GenericImageView, ImageBuffer, ImageReader, Rgba, RgbaImage};

use super::source::{DecodedImage, TargetSize};
use super::{FitMode, ImageError, LoaderConfig, ResizeFilter};

/// 等比缩放系数：`min(target_w / src_w, target_h / src_h)`。
pub fn scale_factor(src: (u32, u32), target: TargetSize) -> f64 {
    let (src_w, src_h) = src;
    if src_w == 0 || src_h == 0 {
        return 0.0;
    }
    (target.width as f64 / src_w as f64).min(target.height as f64 / src_h as f64)
}

/// 计算等比缩放后的尺寸（向下取整，最小 1 像素）。
///
/// 使用整数运算避免浮点误差；`allow_upscale = false` 时不会超过原图尺寸。
pub fn fit_dimensions(src: (u32, u32), target: TargetSize, allow_upscale: bool) -> (u32, u32) {
    let (src_w, src_h) = src;
    if src_w == 0 || src_h == 0 || target.is_empty() {
        return (src_w.max(1), src_h.max(1));
    }

    if !allow_upscale && src_w <= target.width && src_h <= target.height {
        return (src_w, src_h);
    }

    let (tw, th, sw, sh) = (
        target.width as u64,
        target.height as u64,
        src_w as u64,
        src_h as u64,
    );

    // tw / sw <= th / sh  <=>  tw * sh <= th * sw：宽度先触顶。
    let (w, h) = if tw * sh <= th * sw {
        (tw, sh * tw / sw)
    } else {
        (sw * th / sh, th)
    };

    ((w.max(1)) as u32, (h.max(1)) as u32)
}

/// 居中偏移：`((target_w - scaled_w) / 2, (target_h - scaled_h) / 2)`。
pub fn center_offset(scaled: (u32, u32), target: TargetSize) -> (u32, u32) {
    (
        target.width.saturating_sub(scaled.0) / 2,
        target.height.saturating_sub(scaled.1) / 2,
    )
}

/// 将原始字节解码并缩放到目标尺寸，输出 RGBA8。
pub fn decode_and_resize(
    bytes: &[u8],
    target: TargetSize,
    config: &LoaderConfig,
) -> Result<DecodedImage, ImageError> {
    if target.is_empty() {
        return Err(ImageError::Decode(format!("目标尺寸无效：{}", target)));
    }

    validate_image_signature(bytes)?;

    let (header_width, header_height) = inspect_dimensions_from_memory(bytes)?;
    validate_pixel_limits(config, header_width, header_height)?;

    let decoded = image::load_from_memory(bytes)
        .map_err(|e| ImageError::Decode(format!("图片解码失败：{}", e)))?;

    let (raw_width, raw_height) = decoded.dimensions();
    validate_pixel_limits(config, raw_width, raw_height)?;

    let output = match config.fit_mode {
        FitMode::Canvas => {
            let scaled_dims = fit_dimensions((raw_width, raw_height), target, true);
            let scaled = resize_to(decoded, scaled_dims, config.resize_filter)?;
            place_on_canvas(&scaled, target)
        }
        FitMode::Scale => {
            let scaled_dims = fit_dimensions((raw_width, raw_height), target, false);
            resize_to(decoded, scaled_dims, config.resize_filter)?
        }
        FitMode::Stretch => resize_to(decoded, (target.width, target.height), config.resize_filter)?,
    };

    log::debug!(
        "🧩 解码完成：{}x{} -> {}x{}（mode={:?}, filter={:?}）",
        raw_width,
        raw_height,
        output.width(),
        output.height(),
        config.fit_mode,
        config.resize_filter
    );

    Ok(DecodedImage::from_rgba(output))
}

/// 把缩放结果居中贴到目标尺寸的透明画布上。
pub fn place_on_canvas(scaled: &RgbaImage, target: TargetSize) -> RgbaImage {
    let mut canvas = RgbaImage::from_pixel(target.width, target.height, Rgba([0, 0, 0, 0]));
    let (x, y) = center_offset(scaled.dimensions(), target);
    image::imageops::replace(&mut canvas, scaled, x as i64, y as i64);
    canvas
}

/// 通过文件签名校验输入是否为图片。
fn validate_image_signature(bytes: &[u8]) -> Result<(), ImageError> {
    if bytes.is_empty() {
        return Err(ImageError::Decode("图片内容为空".to_string()));
    }

    let kind = infer::get(bytes)
        .ok_or_else(|| ImageError::Decode("无法识别图片类型".to_string()))?;

    if kind.matcher_type() != infer::MatcherType::Image {
        return Err(ImageError::Decode(format!(
            "文件签名不是图片类型：{}",
            kind.mime_type()
        )));
    }

    Ok(())
}

/// 仅通过内存中的图片头信息读取宽高。
fn inspect_dimensions_from_memory(bytes: &[u8]) -> Result<(u32, u32), ImageError> {
    let reader = ImageReader::new(Cursor::new(bytes))
        .with_guessed_format()
        .map_err(|e| ImageError::Decode(format!("无法识别图片格式：{}", e)))?;

    reader
        .into_dimensions()
        .map_err(|e| ImageError::Decode(format!("无法读取图片尺寸：{}", e)))
}

fn validate_pixel_limits(config: &LoaderConfig, width: u32, height: u32) -> Result<(), ImageError> {
    let pixels = (width as u64)
        .checked_mul(height as u64)
        .ok_or_else(|| ImageError::ResourceLimit("图片像素数溢出".to_string()))?;

    if pixels == 0 {
        return Err(ImageError::Decode("图片尺寸为 0".to_string()));
    }

    if pixels > config.max_decoded_pixels {
        return Err(ImageError::ResourceLimit(format!(
            "图片像素过大：{} 像素（限制：{} 像素）",
            pixels, config.max_decoded_pixels
        )));
    }

    Ok(())
}

/// 缩放到指定尺寸；尺寸不变时只做 RGBA 转换。
fn resize_to(
    image: DynamicImage,
    (target_width, target_height): (u32, u32),
    filter: ResizeFilter,
) -> Result<RgbaImage, ImageError> {
    if image.dimensions() == (target_width, target_height) {
        return Ok(image.to_rgba8());
    }

    match resize_with_fast_image_resize(&image, target_width, target_height, filter) {
        Ok(resized) => Ok(resized),
        Err(err) => {
            log::warn!(
                "⚠️ fast_image_resize 缩放失败，回退 image::resize_exact：{}",
                err
            );
            Ok(image
                .resize_exact(target_width, target_height, filter.to_image_filter())
                .to_rgba8())
        }
    }
}

fn resize_with_fast_image_resize(
    image: &DynamicImage,
    target_width: u32,
    target_height: u32,
    filter: ResizeFilter,
) -> Result<RgbaImage, ImageError> {
    let src = image.to_rgba8();
    let (src_width, src_height) = src.dimensions();

    let src_image = fr::images::Image::from_vec_u8(
        src_width,
        src_height,
        src.into_raw(),
        fr::PixelType::U8x4,
    )
    .map_err(|e| ImageError::Decode(format!("构建源图像缓冲失败：{}", e)))?;

    let mut dst_image = fr::images::Image::new(target_width, target_height, fr::PixelType::U8x4);

    let mut resizer = fr::Resizer::new();
    let options = fr::ResizeOptions::new()
        .resize_alg(fr::ResizeAlg::Convolution(filter.to_fast_filter()));

    resizer
        .resize(&src_image, &mut dst_image, Some(&options))
        .map_err(|e| ImageError::Decode(format!("fast_image_resize 执行失败：{}", e)))?;

    ImageBuffer::<Rgba<u8>, Vec<u8>>::from_raw(target_width, target_height, dst_image.into_vec())
        .ok_or_else(|| ImageError::Decode("fast_image_resize 输出缓冲长度异常".to_string()))
}
