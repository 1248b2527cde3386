//! cpio "newc" archives
//!
//! Ramdisks are parsed into memory, unpacked into a directory for patching
//! and collected back from that directory. Ownership is not preserved: every
//! entry is written as uid/gid 0, which is what a ramdisk expects anyway.
//!
//! Device nodes, fifos and sockets can't be created without privileges, so
//! they stay in the parsed entry list and [`collect_over`] puts them back.
//! Hardlinked files come out as independent copies of the shared data.

use std::collections::{HashMap, HashSet};
use std::fs;
use std::os::unix::fs::{symlink, MetadataExt, PermissionsExt};
use std::path::{Path, PathBuf};

use multirom_core::{
    sanitize_entry_path, validate_allocation_size, Error, Result, MAX_ARCHIVE_ENTRIES,
    MAX_CPIO_ENTRY_SIZE, MAX_CPIO_NAME_SIZE,
};

const NEWC_MAGIC: &[u8; 6] = b"070701";
const NEWC_CRC_MAGIC: &[u8; 6] = b"070702";
const HEADER_SIZE: usize = 110;
const TRAILER: &str = "TRAILER!!!";

const S_IFMT: u32 = 0o170000;
const S_IFDIR: u32 = 0o040000;
const S_IFREG: u32 = 0o100000;
const S_IFLNK: u32 = 0o120000;

/// Payload of a cpio entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CpioData {
    File(Vec<u8>),
    Directory,
    Symlink(String),
    /// Device nodes, fifos and sockets; kept as raw data
    Other(Vec<u8>),
}

/// One archive member
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CpioEntry {
    /// Path relative to the archive root, without a leading `./`
    pub name: String,
    /// File type and permission bits
    pub mode: u32,
    pub mtime: u32,
    /// Device number of a block or character device node
    pub rdev_major: u32,
    pub rdev_minor: u32,
    pub data: CpioData,
}

impl CpioEntry {
    fn new(name: impl Into<String>, mode: u32, data: CpioData) -> Self {
        Self {
            name: name.into(),
            mode,
            mtime: 0,
            rdev_major: 0,
            rdev_minor: 0,
            data,
        }
    }

    pub fn file(name: impl Into<String>, perm: u32, content: impl Into<Vec<u8>>) -> Self {
        Self::new(name, S_IFREG | (perm & 0o7777), CpioData::File(content.into()))
    }

    pub fn directory(name: impl Into<String>, perm: u32) -> Self {
        Self::new(name, S_IFDIR | (perm & 0o7777), CpioData::Directory)
    }

    pub fn symlink(name: impl Into<String>, target: impl Into<String>) -> Self {
        Self::new(name, S_IFLNK | 0o777, CpioData::Symlink(target.into()))
    }

    /// Device node, fifo or socket; `mode` carries the file type bits
    pub fn special(name: impl Into<String>, mode: u32, rdev_major: u32, rdev_minor: u32) -> Self {
        Self {
            rdev_major,
            rdev_minor,
            ..Self::new(name, mode, CpioData::Other(Vec::new()))
        }
    }

    pub fn is_special(&self) -> bool {
        matches!(self.data, CpioData::Other(_))
    }

    pub fn permissions(&self) -> u32 {
        self.mode & 0o7777
    }

    fn payload(&self) -> &[u8] {
        match &self.data {
            CpioData::File(d) | CpioData::Other(d) => d,
            CpioData::Symlink(t) => t.as_bytes(),
            CpioData::Directory => &[],
        }
    }
}

fn align4(n: usize) -> usize {
    (n + 3) & !3
}

fn hex_field(header: &[u8], index: usize) -> Result<u32> {
    let start = 6 + index * 8;
    let text = std::str::from_utf8(&header[start..start + 8])
        .map_err(|_| Error::invalid_archive("non-ASCII cpio header"))?;
    u32::from_str_radix(text, 16)
        .map_err(|_| Error::invalid_archive(format!("bad cpio header field '{}'", text)))
}

/// Identity shared by the links of one hardlinked file
type LinkKey = (u32, u32, u32);

/// Parse a newc archive up to its trailer
///
/// Hardlinks carry their data on one link only; every link gets a copy.
pub fn parse(data: &[u8]) -> Result<Vec<CpioEntry>> {
    let mut entries = Vec::new();
    let mut links: Vec<Option<LinkKey>> = Vec::new();
    let mut offset = 0;

    loop {
        let header = data
            .get(offset..offset + HEADER_SIZE)
            .ok_or_else(|| Error::invalid_archive("truncated cpio header"))?;

        let magic = &header[..6];
        if magic != NEWC_MAGIC && magic != NEWC_CRC_MAGIC {
            return Err(Error::invalid_archive(format!(
                "bad cpio magic {:?} at offset {}",
                String::from_utf8_lossy(magic),
                offset
            )));
        }

        let ino = hex_field(header, 0)?;
        let mode = hex_field(header, 1)?;
        let nlink = hex_field(header, 4)?;
        let mtime = hex_field(header, 5)?;
        let file_size = hex_field(header, 6)? as u64;
        let dev = (hex_field(header, 7)?, hex_field(header, 8)?);
        let rdev_major = hex_field(header, 9)?;
        let rdev_minor = hex_field(header, 10)?;
        let name_size = hex_field(header, 11)? as u64;

        let name_size = validate_allocation_size(name_size, MAX_CPIO_NAME_SIZE, "cpio name")?;
        let file_size = validate_allocation_size(file_size, MAX_CPIO_ENTRY_SIZE, "cpio entry")?;
        if name_size == 0 {
            return Err(Error::invalid_archive("empty cpio entry name"));
        }

        let name_start = offset + HEADER_SIZE;
        let raw_name = data
            .get(name_start..name_start + name_size)
            .ok_or_else(|| Error::invalid_archive("truncated cpio name"))?;
        let name = String::from_utf8_lossy(&raw_name[..name_size - 1]).into_owned();

        let data_start = align4(name_start + name_size);
        let payload = data
            .get(data_start..data_start + file_size)
            .ok_or_else(|| Error::invalid_archive(format!("truncated cpio entry '{}'", name)))?;
        offset = align4(data_start + file_size);

        if name == TRAILER {
            break;
        }

        let name = name.trim_start_matches("./").to_string();
        if name.is_empty() || name == "." {
            continue;
        }

        let data = match mode & S_IFMT {
            S_IFDIR => CpioData::Directory,
            S_IFREG => CpioData::File(payload.to_vec()),
            S_IFLNK => CpioData::Symlink(String::from_utf8_lossy(payload).into_owned()),
            _ => CpioData::Other(payload.to_vec()),
        };
        let link = (mode & S_IFMT == S_IFREG && nlink > 1).then_some((dev.0, dev.1, ino));
        links.push(link);
        entries.push(CpioEntry {
            name,
            mode,
            mtime,
            rdev_major,
            rdev_minor,
            data,
        });

        if entries.len() > MAX_ARCHIVE_ENTRIES {
            return Err(Error::invalid_archive("too many cpio entries"));
        }
    }

    resolve_hardlinks(&mut entries, &links);
    Ok(entries)
}

/// Copy the data of each hardlinked file onto its empty links
fn resolve_hardlinks(entries: &mut [CpioEntry], links: &[Option<LinkKey>]) {
    let mut shared: HashMap<LinkKey, Vec<u8>> = HashMap::new();
    for (entry, link) in entries.iter().zip(links) {
        if let (Some(key), CpioData::File(content)) = (link, &entry.data) {
            if !content.is_empty() {
                shared.entry(*key).or_insert_with(|| content.clone());
            }
        }
    }
    if shared.is_empty() {
        return;
    }

    for (entry, link) in entries.iter_mut().zip(links) {
        if let (Some(key), CpioData::File(content)) = (link, &mut entry.data) {
            if content.is_empty() {
                if let Some(data) = shared.get(key) {
                    tracing::debug!("Resolved hardlink {}", entry.name);
                    *content = data.clone();
                }
            }
        }
    }
}

/// newc header fields that vary between entries
#[derive(Default)]
struct Header<'a> {
    ino: u32,
    mode: u32,
    nlink: u32,
    mtime: u32,
    size: usize,
    rdev_major: u32,
    rdev_minor: u32,
    name: &'a str,
}

impl Header<'_> {
    fn push(&self, out: &mut Vec<u8>) {
        let fields = [
            self.ino,
            self.mode,
            0, // uid
            0, // gid
            self.nlink,
            self.mtime,
            self.size as u32,
            0, // devmajor
            0, // devminor
            self.rdev_major,
            self.rdev_minor,
            self.name.len() as u32 + 1,
            0, // check
        ];

        out.extend_from_slice(NEWC_MAGIC);
        for field in fields {
            out.extend_from_slice(format!("{:08x}", field).as_bytes());
        }
        out.extend_from_slice(self.name.as_bytes());
        out.push(0);
        out.resize(align4(out.len()), 0);
    }
}

/// Serialize entries, in order, followed by the trailer
pub fn write(entries: &[CpioEntry]) -> Vec<u8> {
    let mut out = Vec::new();

    for (i, entry) in entries.iter().enumerate() {
        let payload = entry.payload();
        Header {
            ino: 300_000 + i as u32,
            mode: entry.mode,
            nlink: if entry.mode & S_IFMT == S_IFDIR { 2 } else { 1 },
            mtime: entry.mtime,
            size: payload.len(),
            rdev_major: entry.rdev_major,
            rdev_minor: entry.rdev_minor,
            name: &entry.name,
        }
        .push(&mut out);
        out.extend_from_slice(payload);
        out.resize(align4(out.len()), 0);
    }

    Header {
        nlink: 1,
        name: TRAILER,
        ..Header::default()
    }
    .push(&mut out);
    out
}

/// Unpack entries under `root`
///
/// Files, directories and symlinks are created with their permission bits.
/// Special entries are not created; [`collect_over`] restores them.
pub fn extract(entries: &[CpioEntry], root: &Path) -> Result<()> {
    fs::create_dir_all(root)?;

    for entry in entries {
        let rel = sanitize_entry_path(&entry.name)?;
        if rel.as_os_str().is_empty() {
            continue;
        }
        let path = root.join(&rel);

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        match &entry.data {
            CpioData::Directory => {
                fs::create_dir_all(&path)?;
                fs::set_permissions(&path, fs::Permissions::from_mode(entry.permissions()))?;
            }
            CpioData::File(content) => {
                remove_existing(&path)?;
                fs::write(&path, content)?;
                fs::set_permissions(&path, fs::Permissions::from_mode(entry.permissions()))?;
            }
            CpioData::Symlink(target) => {
                remove_existing(&path)?;
                symlink(target, &path)?;
            }
            CpioData::Other(_) => {
                tracing::debug!("Keeping special ramdisk entry {} aside", entry.name);
            }
        }
    }

    Ok(())
}

fn remove_existing(path: &Path) -> Result<()> {
    match fs::symlink_metadata(path) {
        Ok(meta) if meta.is_dir() => fs::remove_dir_all(path)?,
        Ok(_) => fs::remove_file(path)?,
        Err(_) => {}
    }
    Ok(())
}

/// Collect the tree under `root` into entries, parents before children
pub fn collect(root: &Path) -> Result<Vec<CpioEntry>> {
    let mut entries = Vec::new();
    collect_dir(root, &PathBuf::new(), &mut entries)?;
    Ok(entries)
}

/// Collect the tree under `root`, then add back the special entries of
/// `original` the tree has no file for
///
/// A special entry is dropped only when its parent directory is gone.
pub fn collect_over(root: &Path, original: &[CpioEntry]) -> Result<Vec<CpioEntry>> {
    let mut entries = collect(root)?;
    let names: HashSet<String> = entries.iter().map(|e| e.name.clone()).collect();

    for special in original.iter().filter(|e| e.is_special()) {
        if names.contains(&special.name) {
            continue;
        }
        let rel = sanitize_entry_path(&special.name)?;
        let parent_kept = match rel.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => root.join(parent).is_dir(),
            _ => true,
        };
        if parent_kept {
            entries.push(special.clone());
        } else {
            tracing::warn!("Dropping {}: its directory was removed", special.name);
        }
    }

    Ok(entries)
}

fn collect_dir(root: &Path, rel: &Path, out: &mut Vec<CpioEntry>) -> Result<()> {
    let mut children: Vec<_> = fs::read_dir(root.join(rel))?.collect::<std::io::Result<_>>()?;
    children.sort_by_key(|e| e.file_name());

    for child in children {
        let child_rel = rel.join(child.file_name());
        let path = root.join(&child_rel);
        let meta = fs::symlink_metadata(&path)?;
        let name = child_rel.to_string_lossy().into_owned();
        let mtime = meta.mtime().clamp(0, u32::MAX as i64) as u32;

        let data = if meta.file_type().is_symlink() {
            CpioData::Symlink(fs::read_link(&path)?.to_string_lossy().into_owned())
        } else if meta.is_dir() {
            CpioData::Directory
        } else if meta.is_file() {
            validate_allocation_size(meta.len(), MAX_CPIO_ENTRY_SIZE, "ramdisk file")?;
            CpioData::File(fs::read(&path)?)
        } else {
            tracing::warn!("Skipping special file {}", path.display());
            continue;
        };

        let is_dir = matches!(data, CpioData::Directory);
        out.push(CpioEntry {
            name,
            mode: meta.mode(),
            mtime,
            rdev_major: 0,
            rdev_minor: 0,
            data,
        });

        if is_dir {
            collect_dir(root, &child_rel, out)?;
        }
    }

    Ok(())
}

/// Find an entry by name
pub fn find<'a>(entries: &'a [CpioEntry], name: &str) -> Option<&'a CpioEntry> {
    entries.iter().find(|e| e.name == name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn sample() -> Vec<CpioEntry> {
        vec![
            CpioEntry::file("default.prop", 0o644, b"ro.secure=1\n".to_vec()),
            CpioEntry::file("init", 0o750, b"\x7fELF init".to_vec()),
            CpioEntry::file("init.rc", 0o750, b"on boot\n".to_vec()),
            CpioEntry::directory("sbin", 0o750),
            CpioEntry::symlink("sbin/ueventd", "../init"),
        ]
    }

    #[test]
    fn test_write_then_parse() {
        let entries = sample();
        let archive = write(&entries);
        assert_eq!(&archive[..6], b"070701");
        assert_eq!(archive.len() % 4, 0);
        assert_eq!(parse(&archive).unwrap(), entries);
    }

    #[test]
    fn test_parse_strips_dot_prefix() {
        let mut entries = vec![CpioEntry::directory(".", 0o755)];
        entries.push(CpioEntry::file("./init", 0o755, b"x".to_vec()));
        let parsed = parse(&write(&entries)).unwrap();
        assert_eq!(parsed.len(), 1);
        assert_eq!(parsed[0].name, "init");
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(parse(b"not a cpio archive at all, but long enough to hold a header......................................................").is_err());
        let mut archive = write(&sample());
        archive.truncate(200);
        assert!(parse(&archive).is_err());
    }

    #[test]
    fn test_extract_and_collect() {
        let dir = TempDir::new().unwrap();
        let root = dir.path().join("rd");
        extract(&sample(), &root).unwrap();

        assert_eq!(fs::read(root.join("init")).unwrap(), b"\x7fELF init");
        assert_eq!(
            fs::metadata(root.join("init")).unwrap().permissions().mode() & 0o777,
            0o750
        );
        assert_eq!(
            fs::read_link(root.join("sbin/ueventd")).unwrap(),
            PathBuf::from("../init")
        );

        let collected = collect(&root).unwrap();
        let names: Vec<_> = collected.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, vec!["default.prop", "init", "init.rc", "sbin", "sbin/ueventd"]);
        assert_eq!(
            find(&collected, "sbin/ueventd").unwrap().data,
            CpioData::Symlink("../init".to_string())
        );
        assert_eq!(find(&collected, "init").unwrap().permissions(), 0o750);
    }

    fn push_file(out: &mut Vec<u8>, name: &str, ino: u32, nlink: u32, content: &[u8]) {
        Header {
            ino,
            mode: S_IFREG | 0o755,
            nlink,
            size: content.len(),
            name,
            ..Header::default()
        }
        .push(out);
        out.extend_from_slice(content);
        out.resize(align4(out.len()), 0);
    }

    fn hardlinked_archive() -> Vec<u8> {
        let mut out = Vec::new();
        Header {
            ino: 1,
            mode: S_IFDIR | 0o755,
            nlink: 2,
            name: "sbin",
            ..Header::default()
        }
        .push(&mut out);
        push_file(&mut out, "sbin/a", 7, 2, b"");
        push_file(&mut out, "sbin/b", 7, 2, b"BIN!");
        push_file(&mut out, "sbin/empty", 8, 1, b"");
        Header {
            nlink: 1,
            name: TRAILER,
            ..Header::default()
        }
        .push(&mut out);
        out
    }

    #[test]
    fn test_hardlinks_share_data() {
        let entries = parse(&hardlinked_archive()).unwrap();
        assert_eq!(find(&entries, "sbin/a").unwrap().data, CpioData::File(b"BIN!".to_vec()));
        assert_eq!(find(&entries, "sbin/b").unwrap().data, CpioData::File(b"BIN!".to_vec()));
        assert_eq!(find(&entries, "sbin/empty").unwrap().data, CpioData::File(Vec::new()));

        let dir = TempDir::new().unwrap();
        let root = dir.path().join("rd");
        extract(&entries, &root).unwrap();
        let reparsed = parse(&write(&collect(&root).unwrap())).unwrap();
        assert_eq!(find(&reparsed, "sbin/a").unwrap().data, CpioData::File(b"BIN!".to_vec()));
    }

    #[test]
    fn test_device_node_survives_repack() {
        let original = vec![
            CpioEntry::file("init", 0o750, b"init".to_vec()),
            CpioEntry::directory("dev", 0o755),
            CpioEntry::special("dev/console", 0o020600, 5, 1),
            CpioEntry::special("dev/initctl", 0o010644, 0, 0),
        ];
        let parsed = parse(&write(&original)).unwrap();
        assert_eq!(find(&parsed, "dev/console").unwrap(), &original[2]);

        let dir = TempDir::new().unwrap();
        let root = dir.path().join("rd");
        extract(&parsed, &root).unwrap();
        assert!(fs::symlink_metadata(root.join("dev/console")).is_err());

        let repacked = parse(&write(&collect_over(&root, &parsed).unwrap())).unwrap();
        let console = find(&repacked, "dev/console").unwrap();
        assert_eq!(console.mode, 0o020600);
        assert_eq!((console.rdev_major, console.rdev_minor), (5, 1));
        assert!(find(&repacked, "dev/initctl").unwrap().is_special());
        assert!(find(&repacked, "init").is_some());
    }

    #[test]
    fn test_special_entry_follows_its_directory() {
        let original = vec![
            CpioEntry::directory("dev", 0o755),
            CpioEntry::special("dev/null", 0o020666, 1, 3),
        ];
        let dir = TempDir::new().unwrap();
        let root = dir.path().join("rd");
        extract(&original, &root).unwrap();
        fs::remove_dir(root.join("dev")).unwrap();

        assert!(collect_over(&root, &original).unwrap().is_empty());
    }

    #[test]
    fn test_extract_rejects_escaping_names() {
        let dir = TempDir::new().unwrap();
        let evil = vec![CpioEntry::file("../escape", 0o644, b"x".to_vec())];
        assert!(extract(&evil, &dir.path().join("rd")).is_err());
        assert!(!dir.path().join("escape").exists());
    }
}
