//! Disk image format conversion through `qemu-img`

use std::path::{Path, PathBuf};

use log::{debug, info};
use types::{StorageFormat, VapdiskError};

use crate::{command::Command, exec::Executor};

const RAW_EXTENSION: &str = "raw";

/// Path of the raw image the engine works on, for a final image at `path`.
///
/// A `.<format>` suffix is swapped for `.raw`, anything else gets `.raw`
/// appended.
#[must_use]
pub fn working_image_path(path: &Path, format: StorageFormat) -> PathBuf {
    if format != StorageFormat::Raw && path.extension().is_some_and(|ext| ext == format.as_str()) {
        return path.with_extension(RAW_EXTENSION);
    }

    let mut name = path.as_os_str().to_owned();
    name.push(".");
    name.push(RAW_EXTENSION);

    PathBuf::from(name)
}

/// Path of the converted image, next to the raw one
#[must_use]
pub fn converted_image_path(raw: &Path, format: StorageFormat) -> PathBuf {
    if raw.extension().is_some_and(|ext| ext == RAW_EXTENSION) {
        raw.with_extension(format.as_str())
    } else {
        let mut name = raw.as_os_str().to_owned();
        name.push(".");
        name.push(format.as_str());

        PathBuf::from(name)
    }
}

/// Checks that `qemu-img` is around when the final image needs a conversion
///
/// # Errors
///
/// If the format isn't raw and `qemu-img` can't be found
pub fn check_converter(exec: &dyn Executor, format: StorageFormat) -> Result<(), VapdiskError> {
    if format == StorageFormat::Raw {
        return Ok(());
    }

    let path = Command::new("which").arg("qemu-img").run(exec)?;
    debug!("Using qemu-img at {}", path.trim());

    Ok(())
}

/// Converts a raw image to `format`, removes the raw image and returns the
/// path of the converted one.
///
/// Raw images are left alone.
///
/// # Errors
///
/// If `qemu-img` fails or if the raw image can't be removed
pub fn convert(exec: &dyn Executor, raw: &Path, format: StorageFormat) -> Result<PathBuf, VapdiskError> {
    if format == StorageFormat::Raw {
        debug!("Raw image requested, no conversion");
        return Ok(raw.to_path_buf());
    }

    let converted = converted_image_path(raw, format);

    Command::new("sync").run(exec)?;
    Command::new("qemu-img")
        .args(["convert", "-f", RAW_EXTENSION, "-O", format.as_str()])
        .path(raw)
        .path(&converted)
        .run(exec)?;
    Command::new("rm").arg("-rf").path(raw).run(exec)?;

    info!(
        "Converted {} to {format} image {}",
        raw.display(),
        converted.display()
    );

    Ok(converted)
}
