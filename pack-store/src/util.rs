//! Small filesystem helpers shared across the store.

use std::path::Path;

use crate::error::Result;

/// Atomically rewrite `path` with `data`: write to a sibling temp file, then
/// rename over the target. Mirrors the teacher's `replace_file` helper used
/// for the chunk store's rename-into-place writes.
pub fn replace_file(path: &Path, data: &[u8], fsync: bool) -> Result<()> {
    let tmp_path = path.with_extension("tmp");
    {
        let file = pack_io::File::open(pack_io::Mode::ReadWrite, pack_io::OpenMode::Create, &tmp_path)?;
        file.set_len(0)?;
        file.pwrite_all(data, 0)?;
        if fsync {
            file.fsync()?;
        }
    }
    std::fs::rename(&tmp_path, path).map_err(|source| {
        pack_io::Error::IoMisc {
            path: path.to_owned(),
            source,
        }
    })?;
    Ok(())
}
