use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use tracing::warn;

use crate::common::{CannonError, PageId, Result};

/// Page number that seals a frame group as a commit record.
pub const COMMIT_SENTINEL: u32 = 0xFFFF_FFFF;

/// Frame header: page number, payload length, CRC32. All big-endian.
pub const FRAME_HEADER_SIZE: usize = 12;

/// Append-only write-ahead log of committed page images.
///
/// Frames are `[page u32][len u32][crc32 u32][payload]`; a commit record is
/// a frame with the sentinel page number, zero length, and a CRC32 over the
/// CRC words of every frame appended since the previous commit record. Only
/// groups sealed by a valid commit record survive recovery.
///
/// The log indexes frames in memory (page number to payload offset) in two
/// generations: `pending` frames await their commit record, `committed`
/// frames await the next checkpoint. A page's latest image is served from
/// those indexes so readers never see the stale main file mid-session.
pub struct Wal {
    file: File,
    path: PathBuf,
    page_size: u32,
    pending: BTreeMap<u32, u64>,
    committed: BTreeMap<u32, u64>,
    group_crcs: Vec<u32>,
}

impl Wal {
    pub fn open<P: AsRef<Path>>(path: P, page_size: u32) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path.as_ref())?;
        Ok(Self {
            file,
            path: path.as_ref().to_path_buf(),
            page_size,
            pending: BTreeMap::new(),
            committed: BTreeMap::new(),
            group_crcs: Vec::new(),
        })
    }

    /// Whether the log holds anything from a previous incarnation.
    pub fn needs_recovery(&self) -> Result<bool> {
        Ok(self.file.metadata()?.len() > 0)
    }

    /// Scans the log and returns the page images of every sealed commit
    /// group, ascending by page number with later groups superseding
    /// earlier ones. A torn trailing group is discarded with a warning; a
    /// frame whose CRC does not match inside a sealed group is corruption.
    pub fn recover(&mut self) -> Result<Vec<(PageId, Vec<u8>)>> {
        let file_len = self.file.metadata()?.len();
        let frame_len = FRAME_HEADER_SIZE as u64 + self.page_size as u64;

        let mut sealed: BTreeMap<u32, u64> = BTreeMap::new();
        let mut group: Vec<(u32, u64, bool)> = Vec::new();
        let mut group_crcs: Vec<u32> = Vec::new();
        let mut torn = false;
        let mut pos = 0u64;

        while pos + FRAME_HEADER_SIZE as u64 <= file_len {
            let header = self.read_exact_at(pos, FRAME_HEADER_SIZE)?;
            let page = u32::from_be_bytes(header[0..4].try_into().unwrap());
            let len = u32::from_be_bytes(header[4..8].try_into().unwrap());
            let crc = u32::from_be_bytes(header[8..12].try_into().unwrap());

            if page == COMMIT_SENTINEL {
                if len != 0 || crc != group_checksum(&group_crcs) {
                    torn = true;
                    break;
                }
                if let Some(&(bad_page, _, _)) = group.iter().find(|(_, _, ok)| !ok) {
                    return Err(CannonError::CorruptWal(format!(
                        "frame CRC mismatch for page {} in a sealed commit group",
                        bad_page
                    )));
                }
                for (page, offset, _) in group.drain(..) {
                    sealed.insert(page, offset);
                }
                group_crcs.clear();
                pos += FRAME_HEADER_SIZE as u64;
            } else {
                if len != self.page_size || pos + frame_len > file_len {
                    torn = true;
                    break;
                }
                let payload_off = pos + FRAME_HEADER_SIZE as u64;
                let payload = self.read_exact_at(payload_off, self.page_size as usize)?;
                group.push((page, payload_off, crc32fast::hash(&payload) == crc));
                group_crcs.push(crc);
                pos += frame_len;
            }
        }
        if pos < file_len {
            torn = true;
        }
        if torn || !group.is_empty() {
            warn!("discarding uncommitted trailing frames from write-ahead log");
        }

        let mut images = Vec::with_capacity(sealed.len());
        for (page, offset) in sealed {
            let payload = self.read_exact_at(offset, self.page_size as usize)?;
            images.push((PageId::new(page), payload));
        }
        Ok(images)
    }

    /// Appends one page frame without syncing.
    pub fn append_frame(&mut self, page: PageId, image: &[u8]) -> Result<()> {
        assert_eq!(image.len(), self.page_size as usize);
        let crc = crc32fast::hash(image);
        let pos = self.file.seek(SeekFrom::End(0))?;
        self.file.write_all(&page.as_u32().to_be_bytes())?;
        self.file.write_all(&self.page_size.to_be_bytes())?;
        self.file.write_all(&crc.to_be_bytes())?;
        self.file.write_all(image)?;
        self.pending
            .insert(page.as_u32(), pos + FRAME_HEADER_SIZE as u64);
        self.group_crcs.push(crc);
        Ok(())
    }

    /// Seals the pending frame group with a commit record and syncs the
    /// log. A no-op when nothing was appended since the last record.
    pub fn commit(&mut self) -> Result<()> {
        if self.group_crcs.is_empty() {
            return Ok(());
        }
        self.file.seek(SeekFrom::End(0))?;
        self.file.write_all(&COMMIT_SENTINEL.to_be_bytes())?;
        self.file.write_all(&0u32.to_be_bytes())?;
        self.file
            .write_all(&group_checksum(&self.group_crcs).to_be_bytes())?;
        self.file.sync_all()?;
        self.group_crcs.clear();
        let pending = std::mem::take(&mut self.pending);
        self.committed.extend(pending);
        Ok(())
    }

    pub fn has_pending(&self) -> bool {
        !self.pending.is_empty()
    }

    pub fn has_committed(&self) -> bool {
        !self.committed.is_empty()
    }

    /// Latest logged image of a page, pending frames first.
    pub fn page_image(&mut self, page: PageId) -> Result<Option<Vec<u8>>> {
        let offset = self
            .pending
            .get(&page.as_u32())
            .or_else(|| self.committed.get(&page.as_u32()))
            .copied();
        match offset {
            Some(offset) => Ok(Some(self.read_exact_at(offset, self.page_size as usize)?)),
            None => Ok(None),
        }
    }

    /// Sealed page images awaiting checkpoint, ascending by page number.
    pub fn committed_pages(&mut self) -> Result<Vec<(PageId, Vec<u8>)>> {
        let offsets: Vec<(u32, u64)> = self.committed.iter().map(|(&p, &o)| (p, o)).collect();
        let mut images = Vec::with_capacity(offsets.len());
        for (page, offset) in offsets {
            let payload = self.read_exact_at(offset, self.page_size as usize)?;
            images.push((PageId::new(page), payload));
        }
        Ok(images)
    }

    /// Truncates the log after a checkpoint. Unsealed pending frames are
    /// carried over by re-appending them, so an explicit checkpoint while
    /// auto-commit is off cannot drop in-session work.
    pub fn truncate(&mut self) -> Result<()> {
        let mut carried = Vec::with_capacity(self.pending.len());
        for (&page, &offset) in self.pending.clone().iter() {
            carried.push((PageId::new(page), self.read_exact_at(offset, self.page_size as usize)?));
        }

        self.file.set_len(0)?;
        self.file.seek(SeekFrom::Start(0))?;
        self.pending.clear();
        self.committed.clear();
        self.group_crcs.clear();

        for (page, image) in carried {
            self.append_frame(page, &image)?;
        }
        self.file.sync_all()?;
        self.sync_dir()
    }

    fn read_exact_at(&mut self, offset: u64, len: usize) -> Result<Vec<u8>> {
        let mut buf = vec![0u8; len];
        self.file.seek(SeekFrom::Start(offset))?;
        self.file.read_exact(&mut buf)?;
        Ok(buf)
    }

    #[cfg(unix)]
    fn sync_dir(&self) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                File::open(parent)?.sync_all()?;
            }
        }
        Ok(())
    }

    #[cfg(not(unix))]
    fn sync_dir(&self) -> Result<()> {
        Ok(())
    }
}

/// CRC over the big-endian CRC words of a frame group, in append order.
fn group_checksum(frame_crcs: &[u32]) -> u32 {
    let mut hasher = crc32fast::Hasher::new();
    for crc in frame_crcs {
        hasher.update(&crc.to_be_bytes());
    }
    hasher.finalize()
}

#[cfg(test)]
mod tests {
    use super::*;

    const PAGE: u32 = 128;

    fn image(fill: u8) -> Vec<u8> {
        vec![fill; PAGE as usize]
    }

    fn open_wal(dir: &tempfile::TempDir, name: &str) -> Wal {
        Wal::open(dir.path().join(name), PAGE).unwrap()
    }

    #[test]
    fn test_sealed_group_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        {
            let mut wal = open_wal(&dir, "a.wal");
            wal.append_frame(PageId::new(1), &image(0x11)).unwrap();
            wal.append_frame(PageId::new(2), &image(0x22)).unwrap();
            wal.commit().unwrap();
        }
        let mut wal = open_wal(&dir, "a.wal");
        assert!(wal.needs_recovery().unwrap());
        let images = wal.recover().unwrap();
        assert_eq!(images.len(), 2);
        assert_eq!(images[0], (PageId::new(1), image(0x11)));
        assert_eq!(images[1], (PageId::new(2), image(0x22)));
    }

    #[test]
    fn test_later_group_supersedes_earlier() {
        let dir = tempfile::tempdir().unwrap();
        {
            let mut wal = open_wal(&dir, "b.wal");
            wal.append_frame(PageId::new(1), &image(0x11)).unwrap();
            wal.commit().unwrap();
            wal.append_frame(PageId::new(1), &image(0x99)).unwrap();
            wal.commit().unwrap();
        }
        let mut wal = open_wal(&dir, "b.wal");
        let images = wal.recover().unwrap();
        assert_eq!(images, vec![(PageId::new(1), image(0x99))]);
    }

    #[test]
    fn test_torn_tail_is_discarded() {
        let dir = tempfile::tempdir().unwrap();
        {
            let mut wal = open_wal(&dir, "c.wal");
            wal.append_frame(PageId::new(1), &image(0x11)).unwrap();
            wal.commit().unwrap();
            // Frames without a commit record
            wal.append_frame(PageId::new(2), &image(0x22)).unwrap();
        }
        let mut wal = open_wal(&dir, "c.wal");
        let images = wal.recover().unwrap();
        assert_eq!(images, vec![(PageId::new(1), image(0x11))]);
    }

    #[test]
    fn test_corrupt_sealed_frame_fails_recovery() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("d.wal");
        {
            let mut wal = Wal::open(&path, PAGE).unwrap();
            wal.append_frame(PageId::new(1), &image(0x11)).unwrap();
            wal.commit().unwrap();
        }
        // Flip a payload byte inside the sealed frame.
        let mut bytes = std::fs::read(&path).unwrap();
        bytes[FRAME_HEADER_SIZE + 5] ^= 0xFF;
        std::fs::write(&path, bytes).unwrap();

        let mut wal = Wal::open(&path, PAGE).unwrap();
        assert!(matches!(wal.recover(), Err(CannonError::CorruptWal(_))));
    }

    #[test]
    fn test_commit_without_frames_is_noop() {
        let dir = tempfile::tempdir().unwrap();
        let mut wal = open_wal(&dir, "e.wal");
        wal.commit().unwrap();
        assert_eq!(wal.file.metadata().unwrap().len(), 0);
    }

    #[test]
    fn test_page_image_prefers_pending() {
        let dir = tempfile::tempdir().unwrap();
        let mut wal = open_wal(&dir, "f.wal");
        wal.append_frame(PageId::new(1), &image(0x11)).unwrap();
        wal.commit().unwrap();
        wal.append_frame(PageId::new(1), &image(0x22)).unwrap();
        assert_eq!(
            wal.page_image(PageId::new(1)).unwrap(),
            Some(image(0x22))
        );
        assert_eq!(wal.page_image(PageId::new(9)).unwrap(), None);
    }

    #[test]
    fn test_truncate_preserves_pending_frames() {
        let dir = tempfile::tempdir().unwrap();
        let mut wal = open_wal(&dir, "g.wal");
        wal.append_frame(PageId::new(1), &image(0x11)).unwrap();
        wal.commit().unwrap();
        wal.append_frame(PageId::new(2), &image(0x22)).unwrap();

        wal.truncate().unwrap();
        assert!(!wal.has_committed());
        assert!(wal.has_pending());
        assert_eq!(
            wal.page_image(PageId::new(2)).unwrap(),
            Some(image(0x22))
        );
        // The carried frame can still be sealed and recovered.
        wal.commit().unwrap();
        drop(wal);
        let mut wal = open_wal(&dir, "g.wal");
        let images = wal.recover().unwrap();
        assert_eq!(images, vec![(PageId::new(2), image(0x22))]);
    }
}
