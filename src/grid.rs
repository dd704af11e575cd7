// Image grids and PNG export.

use anyhow::{Context, Result};
use candle_core::{DType, Tensor};
use std::path::Path;

/// Tile (N, C, H, W) images into one (C, H', W') image, `nrow` per row.
/// Every cell gets `padding` zero pixels above and to the left, and the grid
/// gets the same on its bottom and right edges.
pub fn make_grid(images: &Tensor, nrow: usize, padding: usize) -> Result<Tensor> {
    let (n, c, h, w) = images.dims4()?;
    if n == 0 {
        return Err(crate::error::EldmError::EmptyInput.into());
    }
    let cols = nrow.clamp(1, n);
    let rows = n.div_ceil(cols);
    let blank = Tensor::zeros((c, h, w), images.dtype(), images.device())?;

    let mut row_tensors = Vec::with_capacity(rows);
    for r in 0..rows {
        let mut cells = Vec::with_capacity(cols);
        for col in 0..cols {
            let idx = r * cols + col;
            let img = if idx < n { images.get(idx)? } else { blank.clone() };
            cells.push(img.pad_with_zeros(1, padding, 0)?.pad_with_zeros(2, padding, 0)?);
        }
        row_tensors.push(Tensor::cat(&cells, 2)?);
    }
    let grid = Tensor::cat(&row_tensors, 1)?;
    grid.pad_with_zeros(1, 0, padding)?
        .pad_with_zeros(2, 0, padding)
        .map_err(Into::into)
}

/// [0, 1] floats to bytes: 255 * x, truncated.
pub fn quantize(x: &Tensor) -> Result<Tensor> {
    x.affine(255.0, 0.0)?.to_dtype(DType::U8).map_err(Into::into)
}

/// (C, H, W) -> (H, W, C)
pub fn to_hwc(x: &Tensor) -> Result<Tensor> {
    x.permute((1, 2, 0))?.contiguous().map_err(Into::into)
}

/// Write a (3, H, W) u8 tensor as PNG.
pub fn save_png(image: &Tensor, path: &Path) -> Result<()> {
    let (c, h, w) = image.dims3()?;
    if c != 3 {
        anyhow::bail!("expected 3 channels, got {c}");
    }
    let data = to_hwc(&image.to_dtype(DType::U8)?)?.flatten_all()?.to_vec1::<u8>()?;
    let buf = image::RgbImage::from_raw(w as u32, h as u32, data)
        .context("pixel buffer does not match image size")?;
    buf.save(path)
        .with_context(|| format!("writing {}", path.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    #[test]
    fn test_grid_layout_matches_padding_rule() -> Result<()> {
        // 2 rows of 4, 3x5 images, padding 2
        let images = Tensor::ones((8, 3, 3, 5), DType::F32, &Device::Cpu)?;
        let grid = make_grid(&images, 4, 2)?;
        assert_eq!(grid.dims3()?, (3, 2 * (3 + 2) + 2, 4 * (5 + 2) + 2));

        let px = |y: usize, x: usize| -> Result<f32> {
            Ok(grid.get(0)?.get(y)?.get(x)?.to_scalar::<f32>()?)
        };
        assert_eq!(px(0, 0)?, 0.0);
        assert_eq!(px(2, 2)?, 1.0);
        assert_eq!(px(2, 7)?, 0.0); // gap between first and second cell
        assert_eq!(px(2, 9)?, 1.0);
        Ok(())
    }

    #[test]
    fn test_partial_last_row_is_blank() -> Result<()> {
        let images = Tensor::ones((3, 3, 2, 2), DType::F32, &Device::Cpu)?;
        let grid = make_grid(&images, 2, 1)?;
        assert_eq!(grid.dims3()?, (3, 2 * 3 + 1, 2 * 3 + 1));
        let last = grid.narrow(1, 4, 2)?.narrow(2, 4, 2)?.sum_all()?.to_scalar::<f32>()?;
        assert_eq!(last, 0.0);
        Ok(())
    }

    #[test]
    fn test_quantize_truncates() -> Result<()> {
        let x = Tensor::new(&[0.0f32, 0.5, 0.999, 1.0], &Device::Cpu)?;
        assert_eq!(quantize(&x)?.to_vec1::<u8>()?, vec![0, 127, 254, 255]);
        Ok(())
    }

    #[test]
    fn test_save_png_roundtrip() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("img.png");
        let data: Vec<u8> = (0..3 * 2 * 4).map(|v| v as u8 * 10).collect();
        let t = Tensor::from_vec(data, (3, 2, 4), &Device::Cpu)?;
        save_png(&t, &path)?;
        let back = image::open(&path)?.to_rgb8();
        assert_eq!(back.dimensions(), (4, 2));
        // channel 1 of pixel (y=0, x=0) is element 8 of the CHW buffer
        assert_eq!(back.get_pixel(0, 0)[1], 80);
        Ok(())
    }
}
