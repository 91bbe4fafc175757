//! Tar packing and unpacking for container file transfer.

use bytes::Bytes;
use futures::stream::{self, BoxStream};
use glob::{MatchOptions, Pattern};
use std::fs;
use std::io::{self, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::warn;

const STREAM_CHUNK: usize = 64 * 1024;
const STREAM_BACKLOG: usize = 8;

#[derive(Debug, Clone)]
struct Rule {
    pattern: Pattern,
    negated: bool,
    dir_only: bool,
    anchored: bool,
}

/// Exclusion rules in ignore-file syntax.
///
/// One pattern per line; `#` starts a comment, `!` re-includes, a trailing
/// `/` matches directories only, and a pattern containing `/` is matched
/// against the path from the root instead of the file name. The last
/// matching rule wins.
#[derive(Debug, Clone, Default)]
pub struct ExcludeSet {
    rules: Vec<Rule>,
}

impl ExcludeSet {
    pub fn new<I, S>(lines: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut set = Self::default();
        set.extend(lines);
        set
    }

    /// Rules from an ignore file; a missing file yields no rules.
    pub fn from_file(path: &Path) -> io::Result<Self> {
        match fs::read_to_string(path) {
            Ok(content) => Ok(Self::new(content.lines())),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(Self::default()),
            Err(e) => Err(e),
        }
    }

    pub fn extend<I, S>(&mut self, lines: I)
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        for line in lines {
            if let Some(rule) = parse_rule(line.as_ref()) {
                self.rules.push(rule);
            }
        }
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// Whether `rel` (relative to the transfer root) is excluded.
    pub fn is_excluded(&self, rel: &Path, is_dir: bool) -> bool {
        let options = MatchOptions {
            require_literal_separator: true,
            ..MatchOptions::new()
        };
        let full = rel.to_string_lossy().replace('\\', "/");
        let name = rel
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();

        let mut excluded = false;
        for rule in &self.rules {
            if rule.dir_only && !is_dir {
                continue;
            }
            let subject = if rule.anchored { &full } else { &name };
            if rule.pattern.matches_with(subject, options) {
                excluded = !rule.negated;
            }
        }
        excluded
    }
}

fn parse_rule(line: &str) -> Option<Rule> {
    let line = line.trim();
    if line.is_empty() || line.starts_with('#') {
        return None;
    }

    let (negated, line) = match line.strip_prefix('!') {
        Some(rest) => (true, rest),
        None => (false, line),
    };
    let (dir_only, line) = match line.strip_suffix('/') {
        Some(rest) => (true, rest),
        None => (false, line),
    };
    let anchored = line.contains('/');
    let line = line.trim_start_matches('/');
    if line.is_empty() {
        return None;
    }

    match Pattern::new(line) {
        Ok(pattern) => Some(Rule {
            pattern,
            negated,
            dir_only,
            anchored,
        }),
        Err(e) => {
            warn!(pattern = %line, error = %e, "Ignoring invalid exclude pattern");
            None
        }
    }
}

/// Pack the contents of `root` into a tar archive written to `writer`, with
/// paths relative to `root`. Symlinks are stored as links.
pub fn pack_into<W: Write>(root: &Path, excludes: &ExcludeSet, writer: W) -> io::Result<W> {
    let mut builder = tar::Builder::new(writer);
    builder.follow_symlinks(false);
    append_tree(&mut builder, root, Path::new(""), excludes)?;
    builder.into_inner()
}

/// Pack the contents of `root` into an in-memory tar archive.
pub fn pack_dir(root: &Path, excludes: &ExcludeSet) -> io::Result<Vec<u8>> {
    pack_into(root, excludes, Vec::new())
}

/// Sends everything written to it as chunks over a channel.
struct ChannelWriter {
    tx: mpsc::Sender<Bytes>,
}

impl Write for ChannelWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.tx
            .blocking_send(Bytes::copy_from_slice(buf))
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "archive receiver dropped"))?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Pack `root` on a blocking thread, yielding the archive in chunks while
/// it is written. At most a few chunks are buffered. The handle reports
/// packing errors; dropping the stream stops the packer with `BrokenPipe`.
pub fn pack_dir_stream(
    root: PathBuf,
    excludes: ExcludeSet,
) -> (BoxStream<'static, Bytes>, JoinHandle<io::Result<()>>) {
    let (tx, rx) = mpsc::channel(STREAM_BACKLOG);
    let packer = tokio::task::spawn_blocking(move || {
        let writer = BufWriter::with_capacity(STREAM_CHUNK, ChannelWriter { tx });
        let mut writer = pack_into(&root, &excludes, writer)?;
        writer.flush()
    });
    let chunks = stream::unfold(rx, |mut rx| async move {
        rx.recv().await.map(|chunk| (chunk, rx))
    });
    (Box::pin(chunks), packer)
}

fn append_tree<W: Write>(
    builder: &mut tar::Builder<W>,
    root: &Path,
    rel: &Path,
    excludes: &ExcludeSet,
) -> io::Result<()> {
    let mut entries = fs::read_dir(root.join(rel))?.collect::<io::Result<Vec<_>>>()?;
    entries.sort_by_key(|entry| entry.file_name());

    for entry in entries {
        let rel_child = rel.join(entry.file_name());
        let is_dir = entry.file_type()?.is_dir();
        if excludes.is_excluded(&rel_child, is_dir) {
            continue;
        }

        if is_dir {
            builder.append_dir(&rel_child, entry.path())?;
            append_tree(builder, root, &rel_child, excludes)?;
        } else {
            builder.append_path_with_name(entry.path(), &rel_child)?;
        }
    }
    Ok(())
}

/// Unpack a tar archive from `reader` into `dest`, creating `dest` first.
pub fn unpack_reader<R: Read>(reader: R, dest: &Path) -> io::Result<()> {
    fs::create_dir_all(dest)?;
    let mut archive = tar::Archive::new(reader);
    archive.set_preserve_permissions(true);
    archive.set_overwrite(true);
    archive.unpack(dest)
}

/// Unpack an in-memory tar archive into `dest`.
pub fn unpack(data: &[u8], dest: &Path) -> io::Result<()> {
    unpack_reader(data, dest)
}

/// Unpack a tar file on disk into `dest`.
pub fn unpack_file(archive: &Path, dest: &Path) -> io::Result<()> {
    unpack_reader(fs::File::open(archive)?, dest)
}
