use std::path::{Path, PathBuf};

#[derive(Debug, thiserror::Error)]
pub enum EnvironmentError {
    #[error("failed to load HDR panorama {path}: {source}")]
    Load {
        path: String,
        #[source]
        source: image::ImageError,
    },
    #[error("HDR panorama {0} has no pixels")]
    Empty(String),
}

/// Equirectangular HDR panorama reduced to a single ambient irradiance term.
pub struct EnvironmentProbe {
    path: PathBuf,
    width: u32,
    height: u32,
    irradiance: [f32; 3],
    pub intensity: f32,
}

impl EnvironmentProbe {
    pub fn load(path: &Path) -> Result<Self, EnvironmentError> {
        let image = image::open(path)
            .map_err(|source| EnvironmentError::Load {
                path: path.display().to_string(),
                source,
            })?
            .into_rgb32f();
        let (width, height) = image.dimensions();
        let probe = Self::from_pixels(path, width, height, image.as_raw())?;
        log::info!(
            "Loaded environment {} ({}x{}), irradiance {:?}",
            path.display(),
            width,
            height,
            probe.irradiance
        );
        Ok(probe)
    }

    pub fn from_pixels(
        path: &Path,
        width: u32,
        height: u32,
        pixels: &[f32],
    ) -> Result<Self, EnvironmentError> {
        if width == 0 || height == 0 || pixels.len() < (width * height * 3) as usize {
            return Err(EnvironmentError::Empty(path.display().to_string()));
        }
        let irradiance = average_radiance(width, height, pixels);
        Ok(Self {
            path: path.to_path_buf(),
            width,
            height,
            irradiance,
            intensity: 1.0,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn size(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    /// Ambient contribution, scaled by `intensity`.
    pub fn irradiance(&self) -> [f32; 3] {
        self.irradiance.map(|channel| channel * self.intensity)
    }
}

impl Drop for EnvironmentProbe {
    fn drop(&mut self) {
        log::debug!("Releasing environment {}", self.path.display());
    }
}

/// Solid-angle weighted mean: rows near the poles cover less of the sphere.
fn average_radiance(width: u32, height: u32, pixels: &[f32]) -> [f32; 3] {
    let mut sum = [0.0_f64; 3];
    let mut weight_sum = 0.0_f64;
    for y in 0..height as usize {
        let theta = std::f64::consts::PI * (y as f64 + 0.5) / height as f64;
        let weight = theta.sin();
        for x in 0..width as usize {
            let index = (y * width as usize + x) * 3;
            for channel in 0..3 {
                let value = pixels[index + channel];
                if value.is_finite() {
                    sum[channel] += value as f64 * weight;
                }
            }
            weight_sum += weight;
        }
    }
    if weight_sum <= 0.0 {
        return [0.0; 3];
    }
    sum.map(|channel| (channel / weight_sum) as f32)
}
