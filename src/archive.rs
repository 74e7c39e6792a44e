use std::env;
use std::ffi::OsString;
use std::fs;
use std::io::{self, Read, Write};
use std::path::{Component, Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use indicatif::{ProgressBar, ProgressStyle};
use log::{debug, info};
use rand::Rng;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::task;
use tokio_util::sync::CancellationToken;

use crate::dialer::{ByteSink, ByteSource};
use crate::{AnyError, Cancelled};

const IO_CHUNK: usize = 16 * 1024;
const PIPE_DEPTH: usize = 64;

/// Stream the given paths through tar+gzip into the sink; `["-"]` copies
/// stdin verbatim into the gzip stream instead.
///
/// The filesystem walk runs on a blocking worker; an async pump moves
/// its output into the sink so the final gzip flush reaches the far side
/// before the stream is shut down.
pub async fn send_files(
    filenames: &[String],
    mut sink: ByteSink,
    cancel: &CancellationToken,
) -> Result<(), AnyError> {
    let (tx, mut rx) = mpsc::channel::<Vec<u8>>(PIPE_DEPTH);
    let names = filenames.to_vec();
    let pack = task::spawn_blocking(move || pack_entries(&names, ChannelWriter { tx }));

    let meter = Meter::new("sending");
    let pump = async {
        while let Some(chunk) = rx.recv().await {
            sink.write_all(&chunk).await?;
            meter.add(chunk.len());
        }
        sink.shutdown().await?;
        Ok::<(), AnyError>(())
    };
    let pump_result = tokio::select! {
        result = pump => result,
        _ = cancel.cancelled() => Err(Cancelled.into()),
    };
    drop(rx);

    let pack_result = pack.await?;
    meter.finish();
    pump_result?;
    pack_result.map_err(|e| format!("tar: {e}"))?;
    Ok(())
}

/// Receive the tar+gzip stream into `destination`; `"-"` copies the
/// gunzipped stream to stdout instead.
pub async fn receive_files(
    mut source: ByteSource,
    destination: &str,
    cancel: &CancellationToken,
) -> Result<(), AnyError> {
    let (tx, rx) = mpsc::channel::<Vec<u8>>(PIPE_DEPTH);
    let dest = destination.to_string();
    let unpack = task::spawn_blocking(move || unpack_entries(ChannelReader::new(rx), &dest));

    let meter = Meter::new("receiving");
    let pump = async {
        let mut buf = vec![0u8; IO_CHUNK];
        loop {
            let n = source.read(&mut buf).await?;
            if n == 0 {
                break;
            }
            if tx.send(buf[..n].to_vec()).await.is_err() {
                break; // unpack side ended; its error surfaces at join
            }
            meter.add(n);
        }
        Ok::<(), AnyError>(())
    };
    let pump_result = tokio::select! {
        result = pump => result,
        _ = cancel.cancelled() => Err(Cancelled.into()),
    };
    drop(tx);

    let unpack_result = unpack.await?;
    meter.finish();
    pump_result?;
    if let Some(note) = unpack_result.map_err(|e| format!("untar: {e}"))? {
        info!("{note}");
    }
    Ok(())
}

fn pack_entries(filenames: &[String], out: ChannelWriter) -> io::Result<()> {
    let mut gz = GzEncoder::new(out, Compression::default());
    if filenames.len() == 1 && filenames[0] == "-" {
        io::copy(&mut io::stdin(), &mut gz)?;
        gz.finish()?;
        return Ok(());
    }

    let mut builder = tar::Builder::new(gz);
    builder.follow_symlinks(false);
    for name in filenames {
        let src = absolute(Path::new(name))?;
        // entries are named after the source root so the receiver keeps
        // the top-level name
        let base: OsString = src
            .file_name()
            .map(|n| n.to_os_string())
            .ok_or_else(|| {
                io::Error::new(
                    io::ErrorKind::InvalidInput,
                    format!("{name}: cannot determine archive name"),
                )
            })?;
        let meta = fs::symlink_metadata(&src)?;
        if meta.is_dir() {
            builder.append_dir_all(&base, &src)?;
        } else {
            builder.append_path_with_name(&src, &base)?;
        }
        debug!("packed {}", src.display());
    }
    let gz = builder.into_inner()?;
    gz.finish()?;
    Ok(())
}

fn unpack_entries(input: ChannelReader, destination: &str) -> io::Result<Option<String>> {
    let mut gz = GzDecoder::new(input);
    if destination == "-" {
        io::copy(&mut gz, &mut io::stdout())?;
        return Ok(None);
    }

    let (dest, dest_file) = parse_dest(destination)?;
    let mut archive = tar::Archive::new(gz);
    archive.set_preserve_permissions(true);

    // the names right under the archive root, for the rename epilogue
    let mut top_level: Vec<String> = Vec::new();
    for entry in archive.entries()? {
        let mut entry = entry?;
        if entry.header().entry_type() == tar::EntryType::XGlobalHeader {
            continue; // pax global header from git-generated tarballs
        }
        let first = entry.path()?.components().find_map(|c| match c {
            Component::Normal(part) => Some(part.to_string_lossy().into_owned()),
            _ => None,
        });
        if let Some(first) = first {
            if !top_level.contains(&first) {
                top_level.push(first);
            }
        }
        entry.unpack_in(&dest)?;
    }

    let Some(dest_file) = dest_file else {
        return Ok(None);
    };
    match top_level.len() {
        0 => {
            fs::remove_dir(&dest)?;
            Ok(None)
        }
        1 => {
            fs::rename(dest.join(&top_level[0]), &dest_file)?;
            fs::remove_dir(&dest)?;
            Ok(None)
        }
        _ => {
            let kept = match fs::rename(&dest, &dest_file) {
                Ok(()) => dest_file,
                Err(_) => dest.display().to_string(), // the tmpdir is fine too
            };
            Ok(Some(format!(
                "received more than one file or dir, saved to dir {kept:?}"
            )))
        }
    }
}

/// Resolve where to extract: an existing directory is used as is; any
/// other target becomes a sibling temp directory plus a pending rename
/// to the requested name.
fn parse_dest(d: &str) -> io::Result<(PathBuf, Option<String>)> {
    if d.is_empty() {
        return Ok((PathBuf::from("."), None));
    }
    let path = Path::new(d);
    if path.is_dir() {
        return Ok((path.to_path_buf(), None));
    }
    let parent = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("."),
    };
    if parent.is_dir() {
        let tmp = make_temp_dir(&parent)?;
        return Ok((tmp, Some(d.to_string())));
    }
    Err(io::Error::new(
        io::ErrorKind::NotFound,
        format!("no such file or directory: {d}"),
    ))
}

fn make_temp_dir(parent: &Path) -> io::Result<PathBuf> {
    loop {
        let name = format!("acp-tmp.{:08x}", rand::thread_rng().gen::<u32>());
        let path = parent.join(name);
        match fs::create_dir(&path) {
            Ok(()) => return Ok(path),
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => continue,
            Err(e) => return Err(e),
        }
    }
}

fn absolute(path: &Path) -> io::Result<PathBuf> {
    if path.is_absolute() {
        Ok(path.to_path_buf())
    } else {
        Ok(env::current_dir()?.join(path))
    }
}

// Write half of the blocking<->async pipe: the tar walk writes here, the
// async pump drains the channel into the network sink.
struct ChannelWriter {
    tx: mpsc::Sender<Vec<u8>>,
}

impl Write for ChannelWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.tx
            .blocking_send(buf.to_vec())
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "transfer stream closed"))?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

struct ChannelReader {
    rx: mpsc::Receiver<Vec<u8>>,
    buf: Vec<u8>,
    pos: usize,
}

impl ChannelReader {
    fn new(rx: mpsc::Receiver<Vec<u8>>) -> Self {
        ChannelReader {
            rx,
            buf: Vec::new(),
            pos: 0,
        }
    }
}

impl Read for ChannelReader {
    fn read(&mut self, out: &mut [u8]) -> io::Result<usize> {
        if self.pos >= self.buf.len() {
            match self.rx.blocking_recv() {
                Some(chunk) => {
                    self.buf = chunk;
                    self.pos = 0;
                }
                None => return Ok(0),
            }
        }
        let n = out.len().min(self.buf.len() - self.pos);
        out[..n].copy_from_slice(&self.buf[self.pos..self.pos + n]);
        self.pos += n;
        Ok(n)
    }
}

// Byte meter for the transfer: an atomic total driving a spinner.
struct Meter {
    bar: ProgressBar,
    total: AtomicU64,
}

impl Meter {
    fn new(verb: &str) -> Self {
        let bar = ProgressBar::new_spinner();
        bar.set_style(
            ProgressStyle::default_spinner()
                .template("{spinner} {msg} {bytes} ({bytes_per_sec})")
                .unwrap(),
        );
        bar.set_message(verb.to_string());
        bar.enable_steady_tick(Duration::from_millis(100));
        Meter {
            bar,
            total: AtomicU64::new(0),
        }
    }

    fn add(&self, n: usize) {
        let total = self.total.fetch_add(n as u64, Ordering::Relaxed) + n as u64;
        self.bar.set_position(total);
    }

    fn finish(&self) {
        self.bar.finish_and_clear();
        debug!("moved {} bytes", self.total.load(Ordering::Relaxed));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::fs::PermissionsExt;

    fn write_file(path: &Path, contents: &[u8]) {
        fs::write(path, contents).unwrap();
    }

    fn tree_fixture(root: &Path) {
        fs::create_dir_all(root.join("src/nested")).unwrap();
        write_file(&root.join("readme.txt"), b"hello over the wire");
        write_file(&root.join("src/data.bin"), &[0xAA; 4096]);
        write_file(&root.join("src/nested/deep.txt"), b"deep");
        #[cfg(unix)]
        {
            let script = root.join("src/run.sh");
            write_file(&script, b"#!/bin/sh\n");
            fs::set_permissions(&script, fs::Permissions::from_mode(0o755)).unwrap();
            std::os::unix::fs::symlink("readme.txt", root.join("link.txt")).unwrap();
        }
    }

    async fn roundtrip(src_args: Vec<String>, dest: &str) {
        let (a, b) = tokio::io::duplex(256 * 1024);
        let cancel = CancellationToken::new();
        let send = send_files(&src_args, Box::new(a), &cancel);
        let recv = receive_files(Box::new(b), dest, &cancel);
        let (sent, received) = tokio::join!(send, recv);
        sent.unwrap();
        received.unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_tree_roundtrip_into_dir() {
        let base = tempfile::tempdir().unwrap();
        let src = base.path().join("project");
        fs::create_dir(&src).unwrap();
        tree_fixture(&src);
        let dst = base.path().join("inbox");
        fs::create_dir(&dst).unwrap();

        roundtrip(
            vec![src.to_str().unwrap().to_string()],
            dst.to_str().unwrap(),
        )
        .await;

        let got = dst.join("project");
        assert_eq!(
            fs::read(got.join("readme.txt")).unwrap(),
            b"hello over the wire"
        );
        assert_eq!(fs::read(got.join("src/data.bin")).unwrap(), vec![0xAA; 4096]);
        assert_eq!(fs::read(got.join("src/nested/deep.txt")).unwrap(), b"deep");
        #[cfg(unix)]
        {
            let mode = fs::metadata(got.join("src/run.sh")).unwrap().permissions().mode();
            assert_eq!(mode & 0o777, 0o755);
            let target = fs::read_link(got.join("link.txt")).unwrap();
            assert_eq!(target, PathBuf::from("readme.txt"));
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_single_file_renamed_to_target() {
        let base = tempfile::tempdir().unwrap();
        let src = base.path().join("original.txt");
        write_file(&src, b"rename me");
        let target = base.path().join("renamed.txt");

        roundtrip(
            vec![src.to_str().unwrap().to_string()],
            target.to_str().unwrap(),
        )
        .await;

        assert_eq!(fs::read(&target).unwrap(), b"rename me");
        // the temp dir is cleaned up
        let leftovers: Vec<_> = fs::read_dir(base.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().starts_with("acp-tmp."))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_multiple_entries_keep_dir() {
        let base = tempfile::tempdir().unwrap();
        let one = base.path().join("one.txt");
        let two = base.path().join("two.txt");
        write_file(&one, b"1");
        write_file(&two, b"2");
        let target = base.path().join("bundle");

        roundtrip(
            vec![
                one.to_str().unwrap().to_string(),
                two.to_str().unwrap().to_string(),
            ],
            target.to_str().unwrap(),
        )
        .await;

        assert_eq!(fs::read(target.join("one.txt")).unwrap(), b"1");
        assert_eq!(fs::read(target.join("two.txt")).unwrap(), b"2");
    }

    #[test]
    fn test_parse_dest_existing_dir() {
        let base = tempfile::tempdir().unwrap();
        let (dest, dest_file) = parse_dest(base.path().to_str().unwrap()).unwrap();
        assert_eq!(dest, base.path());
        assert!(dest_file.is_none());
    }

    #[test]
    fn test_parse_dest_pending_rename() {
        let base = tempfile::tempdir().unwrap();
        let target = base.path().join("newname");
        let (dest, dest_file) = parse_dest(target.to_str().unwrap()).unwrap();
        assert!(dest.starts_with(base.path()));
        assert!(dest
            .file_name()
            .unwrap()
            .to_string_lossy()
            .starts_with("acp-tmp."));
        assert_eq!(dest_file, Some(target.to_str().unwrap().to_string()));
        fs::remove_dir(dest).unwrap();
    }

    #[test]
    fn test_parse_dest_missing_parent() {
        let base = tempfile::tempdir().unwrap();
        let target = base.path().join("no/such/dir/file");
        assert!(parse_dest(target.to_str().unwrap()).is_err());
    }
}
