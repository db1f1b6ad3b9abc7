use std::io::Write;

use flate2::{Compression, GzBuilder};
use tar::{Builder as TarBuilder, EntryType, Header};

use super::RenderedFile;

/// Pack rendered files into a gzip'd tarball whose bytes depend only on
/// the files: entries keep their given order, timestamps and ownership are
/// zeroed and the gzip header carries no name or mtime.
pub fn pack(files: &[RenderedFile]) -> std::io::Result<Vec<u8>> {
    let encoder = GzBuilder::new()
        .mtime(0)
        .write(Vec::new(), Compression::default());
    let mut builder = TarBuilder::new(encoder);
    builder.mode(tar::HeaderMode::Deterministic);

    for file in files {
        let mut header = Header::new_gnu();
        header.set_entry_type(EntryType::Regular);
        header.set_size(file.contents.len() as u64);
        header.set_mode(file.mode);
        header.set_mtime(0);
        header.set_uid(0);
        header.set_gid(0);
        header.set_cksum();
        builder.append_data(&mut header, file.path.trim_start_matches('/'), file.contents.as_bytes())?;
    }

    let mut encoder = builder.into_inner()?;
    encoder.flush()?;
    encoder.finish()
}
