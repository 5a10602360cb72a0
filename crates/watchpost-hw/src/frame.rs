//! Frame type and pixel conversions: YUYV/GREY to RGB, grayscale, Gaussian smoothing.

use image::{GrayImage, Luma, Rgb, RgbImage};

/// A captured color frame.
#[derive(Clone)]
pub struct Frame {
    pub image: RgbImage,
    pub timestamp: std::time::Instant,
    pub sequence: u32,
}

impl Frame {
    pub fn new(image: RgbImage, sequence: u32) -> Self {
        Self {
            image,
            timestamp: std::time::Instant::now(),
            sequence,
        }
    }

    pub fn width(&self) -> u32 {
        self.image.width()
    }

    pub fn height(&self) -> u32 {
        self.image.height()
    }

    /// Luma plane (BT.601 weights).
    pub fn to_gray(&self) -> GrayImage {
        to_gray(&self.image)
    }

    /// Average luma (0.0–255.0).
    pub fn avg_brightness(&self) -> f32 {
        let gray = self.to_gray();
        let raw = gray.as_raw();
        if raw.is_empty() {
            return 0.0;
        }
        raw.iter().map(|&b| b as f32).sum::<f32>() / raw.len() as f32
    }
}

pub fn to_gray(rgb: &RgbImage) -> GrayImage {
    let (w, h) = rgb.dimensions();
    let mut out = GrayImage::new(w, h);
    for (o, p) in out.pixels_mut().zip(rgb.pixels()) {
        let [r, g, b] = p.0;
        let y = 0.299 * r as f32 + 0.587 * g as f32 + 0.114 * b as f32;
        *o = Luma([y.round().clamp(0.0, 255.0) as u8]);
    }
    out
}

/// Convert packed YUYV (4:2:2) to RGB.
///
/// YUYV packs two pixels per 4 bytes: [Y0, U, Y1, V]; both pixels share U/V.
pub fn yuyv_to_rgb(yuyv: &[u8], width: u32, height: u32) -> Result<RgbImage, FrameError> {
    let expected = (width * height * 2) as usize;
    if yuyv.len() < expected || width % 2 != 0 {
        return Err(FrameError::InvalidLength {
            expected,
            actual: yuyv.len(),
        });
    }

    let mut rgb = Vec::with_capacity((width * height * 3) as usize);
    for chunk in yuyv[..expected].chunks_exact(4) {
        let (y0, u, y1, v) = (chunk[0], chunk[1], chunk[2], chunk[3]);
        rgb.extend_from_slice(&ycbcr_to_rgb(y0, u, v));
        rgb.extend_from_slice(&ycbcr_to_rgb(y1, u, v));
    }
    RgbImage::from_raw(width, height, rgb).ok_or(FrameError::InvalidLength {
        expected,
        actual: yuyv.len(),
    })
}

/// Replicate an 8-bit grayscale buffer into RGB.
pub fn grey_to_rgb(grey: &[u8], width: u32, height: u32) -> Result<RgbImage, FrameError> {
    let expected = (width * height) as usize;
    if grey.len() < expected {
        return Err(FrameError::InvalidLength {
            expected,
            actual: grey.len(),
        });
    }
    let mut img = RgbImage::new(width, height);
    for (p, &g) in img.pixels_mut().zip(&grey[..expected]) {
        *p = Rgb([g, g, g]);
    }
    Ok(img)
}

fn ycbcr_to_rgb(y: u8, u: u8, v: u8) -> [u8; 3] {
    let c = y as f32 - 16.0;
    let d = u as f32 - 128.0;
    let e = v as f32 - 128.0;
    let clamp = |x: f32| x.round().clamp(0.0, 255.0) as u8;
    [
        clamp(1.164 * c + 1.596 * e),
        clamp(1.164 * c - 0.392 * d - 0.813 * e),
        clamp(1.164 * c + 2.017 * d),
    ]
}

/// Gaussian blur with a square `ksize` kernel (odd; even sizes are rounded up).
///
/// Sigma follows the usual derivation from kernel size,
/// `0.3 * ((ksize - 1) * 0.5 - 1) + 0.8`. Borders reflect without repeating
/// the edge pixel. `ksize <= 1` returns a copy.
pub fn gaussian_blur(src: &GrayImage, ksize: u32) -> GrayImage {
    if ksize <= 1 {
        return src.clone();
    }
    let ksize = ksize | 1;
    let kernel = gaussian_kernel(ksize);
    let radius = (ksize / 2) as i64;
    let (w, h) = src.dimensions();
    let (wi, hi) = (w as i64, h as i64);

    let mut tmp = vec![0f32; (w * h) as usize];
    for y in 0..hi {
        for x in 0..wi {
            let mut acc = 0.0;
            for (k, weight) in kernel.iter().enumerate() {
                let sx = reflect(x + k as i64 - radius, wi);
                acc += weight * src.get_pixel(sx as u32, y as u32)[0] as f32;
            }
            tmp[(y * wi + x) as usize] = acc;
        }
    }

    let mut out = GrayImage::new(w, h);
    for y in 0..hi {
        for x in 0..wi {
            let mut acc = 0.0;
            for (k, weight) in kernel.iter().enumerate() {
                let sy = reflect(y + k as i64 - radius, hi);
                acc += weight * tmp[(sy * wi + x) as usize];
            }
            out.put_pixel(x as u32, y as u32, Luma([acc.round().clamp(0.0, 255.0) as u8]));
        }
    }
    out
}

fn gaussian_kernel(ksize: u32) -> Vec<f32> {
    let sigma = 0.3 * ((ksize as f32 - 1.0) * 0.5 - 1.0) + 0.8;
    let center = (ksize / 2) as f32;
    let mut kernel: Vec<f32> = (0..ksize)
        .map(|i| {
            let d = i as f32 - center;
            (-(d * d) / (2.0 * sigma * sigma)).exp()
        })
        .collect();
    let sum: f32 = kernel.iter().sum();
    for k in &mut kernel {
        *k /= sum;
    }
    kernel
}

/// Mirror an out-of-range index back into `0..len` (`dcb|abcd|cba`).
fn reflect(i: i64, len: i64) -> i64 {
    if len == 1 {
        return 0;
    }
    let period = 2 * (len - 1);
    let m = i.rem_euclid(period);
    if m < len {
        m
    } else {
        period - m
    }
}

#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("invalid buffer length: expected {expected}, got {actual}")]
    InvalidLength { expected: usize, actual: usize },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_yuyv_to_rgb_neutral_chroma_is_gray() {
        // 2x1 image: [Y0=16, U=128, Y1=235, V=128] → black and white
        let rgb = yuyv_to_rgb(&[16, 128, 235, 128], 2, 1).unwrap();
        assert_eq!(rgb.get_pixel(0, 0).0, [0, 0, 0]);
        assert_eq!(rgb.get_pixel(1, 0).0, [255, 255, 255]);
    }

    #[test]
    fn test_yuyv_invalid_length() {
        assert!(yuyv_to_rgb(&[100, 128], 2, 1).is_err());
    }

    #[test]
    fn test_grey_to_rgb() {
        let rgb = grey_to_rgb(&[7, 200], 2, 1).unwrap();
        assert_eq!(rgb.get_pixel(1, 0).0, [200, 200, 200]);
        assert!(grey_to_rgb(&[1], 2, 1).is_err());
    }

    #[test]
    fn test_to_gray_weights() {
        let img = RgbImage::from_pixel(1, 1, Rgb([255, 0, 0]));
        assert_eq!(to_gray(&img).get_pixel(0, 0)[0], 76);
        let white = RgbImage::from_pixel(1, 1, Rgb([255, 255, 255]));
        assert_eq!(to_gray(&white).get_pixel(0, 0)[0], 255);
    }

    #[test]
    fn test_kernel_is_normalized_and_symmetric() {
        let k = gaussian_kernel(21);
        assert_eq!(k.len(), 21);
        assert!((k.iter().sum::<f32>() - 1.0).abs() < 1e-5);
        assert!((k[0] - k[20]).abs() < 1e-7);
        assert!(k[10] > k[9]);
    }

    #[test]
    fn test_blur_preserves_flat_image() {
        let img = GrayImage::from_pixel(30, 20, Luma([123]));
        let out = gaussian_blur(&img, 21);
        assert!(out.pixels().all(|p| p[0] == 123));
    }

    #[test]
    fn test_blur_spreads_a_point() {
        let mut img = GrayImage::new(31, 31);
        img.put_pixel(15, 15, Luma([255]));
        let out = gaussian_blur(&img, 5);
        assert!(out.get_pixel(15, 15)[0] < 255);
        assert!(out.get_pixel(16, 15)[0] > 0);
        assert_eq!(out.get_pixel(16, 15), out.get_pixel(14, 15));
        assert_eq!(out.get_pixel(0, 0)[0], 0);
    }

    #[test]
    fn test_reflect_101() {
        assert_eq!(reflect(-1, 5), 1);
        assert_eq!(reflect(-2, 5), 2);
        assert_eq!(reflect(5, 5), 3);
        assert_eq!(reflect(6, 5), 2);
        assert_eq!(reflect(3, 1), 0);
    }

    #[test]
    fn test_avg_brightness() {
        let frame = Frame::new(RgbImage::from_pixel(4, 4, Rgb([100, 100, 100])), 0);
        assert!((frame.avg_brightness() - 100.0).abs() < 1e-3);
    }
}
