//! Hard limits that keep stack allocations bounded.

use crate::RecyclerError;

/// Maximum allowed stack payload in bytes (default: 2 GiB).
pub const MAX_STACK_BYTES: usize = 2 * 1024 * 1024 * 1024;
/// Maximum supported width/height of a stack plane.
pub const MAX_STACK_DIMENSION: u32 = 65_536;
/// Maximum supported stack depth (number of planes).
pub const MAX_STACK_DEPTH: u32 = 100_000;

/// Validated stack sizing information.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StackSize {
    /// Voxel count (width * height * depth).
    pub voxels: usize,
    /// Payload size in bytes.
    pub bytes: usize,
}

/// Validate stack dimensions and calculate voxel/byte sizes safely.
pub fn validate_stack_size(
    width: u32,
    height: u32,
    depth: u32,
    bytes_per_voxel: usize,
) -> Result<StackSize, RecyclerError> {
    if width == 0 || height == 0 || depth == 0 {
        return Err(RecyclerError::EmptyStack {
            width,
            height,
            depth,
        });
    }

    if width > MAX_STACK_DIMENSION || height > MAX_STACK_DIMENSION || depth > MAX_STACK_DEPTH {
        return Err(RecyclerError::StackDimensionsTooLarge {
            width,
            height,
            depth,
            max_dimension: MAX_STACK_DIMENSION,
        });
    }

    let voxels = (width as usize)
        .checked_mul(height as usize)
        .and_then(|plane| plane.checked_mul(depth as usize))
        .ok_or(RecyclerError::SizeOverflow {
            context: "stack voxel count",
        })?;

    let bytes = voxels
        .checked_mul(bytes_per_voxel)
        .ok_or(RecyclerError::SizeOverflow {
            context: "stack byte size",
        })?;

    if bytes > MAX_STACK_BYTES {
        return Err(RecyclerError::StackTooLarge {
            bytes,
            max_bytes: MAX_STACK_BYTES,
        });
    }

    Ok(StackSize { voxels, bytes })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_valid_stack_size() {
        let size = validate_stack_size(2048, 2048, 1, 2).unwrap();
        assert_eq!(size.voxels, 2048 * 2048);
        assert_eq!(size.bytes, 2048 * 2048 * 2);
    }

    #[test]
    fn test_zero_dimension_rejected() {
        assert!(matches!(
            validate_stack_size(0, 16, 1, 2),
            Err(RecyclerError::EmptyStack { .. })
        ));
    }

    #[test]
    fn test_oversized_dimension_rejected() {
        assert!(matches!(
            validate_stack_size(MAX_STACK_DIMENSION + 1, 16, 1, 2),
            Err(RecyclerError::StackDimensionsTooLarge { .. })
        ));
    }

    #[test]
    fn test_oversized_payload_rejected() {
        assert!(matches!(
            validate_stack_size(65_536, 65_536, 2, 2),
            Err(RecyclerError::StackTooLarge { .. })
        ));
    }
}
