//! Minimal ustar archive writer for file exports.

use crate::error::{StorageError, StorageResult};
use crate::fileset::{FilesetStore, Manifest};
use bytes::Bytes;

const BLOCK: usize = 512;

/// Archive every file under `path` into a ustar stream, in path order.
/// Entry names are the in-commit paths without the leading slash.
pub async fn write_tar(
    filesets: &FilesetStore,
    manifest: &Manifest,
    path: &str,
) -> StorageResult<Bytes> {
    let mut out = Vec::new();
    for file in manifest.walk(path)? {
        let data = filesets.read_file(manifest, &file.path).await?;
        let name = file.path.trim_start_matches('/');
        append_entry(&mut out, name, &data)?;
    }
    // end-of-archive marker
    out.extend_from_slice(&[0u8; BLOCK * 2]);
    Ok(Bytes::from(out))
}

fn append_entry(out: &mut Vec<u8>, name: &str, data: &[u8]) -> StorageResult<()> {
    if name.len() > 100 {
        return Err(StorageError::InvalidManifest(format!(
            "path too long for tar entry: {name}"
        )));
    }
    let mut header = [0u8; BLOCK];
    header[..name.len()].copy_from_slice(name.as_bytes());
    write_octal(&mut header[100..108], 0o644);
    write_octal(&mut header[108..116], 0);
    write_octal(&mut header[116..124], 0);
    write_octal(&mut header[124..136], data.len() as u64);
    write_octal(&mut header[136..148], 0);
    header[156] = b'0'; // regular file
    header[257..263].copy_from_slice(b"ustar\0");
    header[263..265].copy_from_slice(b"00");

    // checksum is computed with the checksum field set to spaces
    header[148..156].fill(b' ');
    let sum: u64 = header.iter().map(|b| *b as u64).sum();
    write_octal(&mut header[148..155], sum);
    header[155] = 0;

    out.extend_from_slice(&header);
    out.extend_from_slice(data);
    let pad = (BLOCK - data.len() % BLOCK) % BLOCK;
    out.extend_from_slice(&vec![0u8; pad]);
    Ok(())
}

fn write_octal(field: &mut [u8], value: u64) {
    let digits = field.len() - 1;
    let text = format!("{value:0width$o}", width = digits);
    field[..digits].copy_from_slice(&text.as_bytes()[text.len() - digits..]);
    field[digits] = 0;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::MemoryBackend;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_tar_layout() {
        let store = FilesetStore::new(Arc::new(MemoryBackend::new()));
        let mut manifest = Manifest::new();
        store
            .put_file(&mut manifest, "/dir/hello.txt", Bytes::from_static(b"hello"))
            .await
            .unwrap();

        let tar = write_tar(&store, &manifest, "/").await.unwrap();
        // header + padded data + two end blocks
        assert_eq!(tar.len(), BLOCK + BLOCK + 2 * BLOCK);
        assert_eq!(&tar[..14], b"dir/hello.txt\0");
        assert_eq!(&tar[257..262], b"ustar");
        assert_eq!(&tar[BLOCK..BLOCK + 5], b"hello");

        // size field reads back as octal 5
        let size_field = std::str::from_utf8(&tar[124..135]).unwrap();
        assert_eq!(u64::from_str_radix(size_field, 8).unwrap(), 5);
    }

    #[tokio::test]
    async fn test_tar_rejects_long_names() {
        let store = FilesetStore::new(Arc::new(MemoryBackend::new()));
        let mut manifest = Manifest::new();
        let long = format!("/{}", "x".repeat(150));
        store
            .put_file(&mut manifest, &long, Bytes::from_static(b"d"))
            .await
            .unwrap();
        assert!(write_tar(&store, &manifest, "/").await.is_err());
    }
}
