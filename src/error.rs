/*
 * This file is part of blockfs.
 *
 * blockfs is free software: you can redistribute it and/or modify it under the
 * terms of the GNU General Public License as published by the Free Software
 * Foundation, either version 3 of the License, or (at your option) any later
 * version.
 *
 * blockfs is distributed in the hope that it will be useful, but WITHOUT ANY
 * WARRANTY; without even the implied warranty of MERCHANTABILITY or FITNESS FOR
 * A PARTICULAR PURPOSE. See the GNU General Public License for more details.
 *
 * You should have received a copy of the GNU General Public License along with
 * blockfs. If not, see <https://www.gnu.org/licenses/>.
 */

//! The flat error taxonomy shared by every component of the engine.
//!
//! There is deliberately a single error type for the whole crate: the source
//! this engine is modeled on uses one flat set of numeric codes throughout,
//! and splitting that into one error enum per module would only make
//! propagation across module boundaries more awkward for no benefit.

use std::io;

/// Every fallible operation in the engine returns this on failure.
///
/// `SUCCESS` from the original taxonomy is not a variant here: it is simply
/// `Ok(())` or `Ok(T)`.
#[derive(Debug, thiserror::Error)]
pub enum FsError {
    /// Catch-all, also used for "directory not empty".
    #[error("{0}")]
    Generic(String),

    /// A path component or directory entry does not exist.
    #[error("not found")]
    NotFound,

    /// A name already exists at the intended location.
    #[error("already exists")]
    Exists,

    /// The block or inode bitmap is exhausted, the device is too small, or
    /// an output buffer is too small for a reconstructed path.
    #[error("no space left")]
    NoSpace,

    /// A malformed path/name, a wrong inode type, or an invalid argument.
    #[error("invalid argument: {0}")]
    Invalid(String),

    /// The underlying block device failed.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// The on-disk structure read back is inconsistent (bad magic,
    /// corrupted indirect block, wrong block range). Reported to callers
    /// as part of the `IO` family per the error taxonomy.
    #[error("corrupt filesystem structure: {0}")]
    Corrupt(String),

    /// The open file's flags do not permit the requested operation.
    #[error("permission denied")]
    Permission,
}

pub type FsResult<T> = Result<T, FsError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn io_error_converts() {
        let io_err = io::Error::new(io::ErrorKind::Other, "boom");
        let fs_err: FsError = io_err.into();
        assert!(matches!(fs_err, FsError::Io(_)));
    }
}
