//! Pairwise file exchange between two ranks of a group.
//!
//! COPY leaves the source in place and materializes a copy at the receiver;
//! MOVE overwrites the sender's source file in place with the incoming data
//! (separate read and write positions), then truncates and renames it, so a
//! node never needs room for both files at once.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use anyhow::Error;

use scr_cache::Meta;
use scr_comm::Communicator;

use crate::context::Context;
use crate::exchange::sendrecv_hash;
use crate::fileio;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SwapMode {
    Copy,
    Move,
}

/// Exchange file names ahead of the payload. Only the basename travels; the
/// receiver composes the full path under its receive directory.
pub fn swap_file_names(
    comm: &dyn Communicator,
    file_send: Option<&Path>,
    rank_send: Option<usize>,
    rank_recv: Option<usize>,
    dir_recv: Option<&Path>,
) -> Result<Option<PathBuf>, Error> {
    let outgoing = match (rank_send, file_send) {
        (Some(rank), Some(file)) => {
            let name = file
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default();
            Some((rank, name))
        }
        _ => None,
    };
    let incoming = match (rank_recv, dir_recv) {
        (Some(rank), Some(dir)) => Some((rank, dir)),
        _ => None,
    };

    let send = outgoing
        .as_ref()
        .map(|(rank, name)| (*rank, name.as_bytes()));
    let received = comm.sendrecv(send, incoming.as_ref().map(|(rank, _)| *rank))?;

    match (incoming, received) {
        (Some((_, dir)), Some(name)) => {
            let name = String::from_utf8_lossy(&name).into_owned();
            let name = Path::new(&name)
                .file_name()
                .map(|n| n.to_os_string())
                .unwrap_or_default();
            Ok(Some(dir.join(name)))
        }
        _ => Ok(None),
    }
}

/// Copy or move one file between two ranks. Returns false when the received
/// file failed its size or CRC verification (the file is then marked
/// incomplete); unrecoverable I/O aborts the run.
pub fn swap_files(
    ctx: &Context,
    comm: &dyn Communicator,
    mode: SwapMode,
    file_send: Option<&Path>,
    rank_send: Option<usize>,
    file_recv: Option<&Path>,
    rank_recv: Option<usize>,
) -> Result<bool, Error> {
    let mut ok = true;

    let outgoing = match (rank_send, file_send) {
        (Some(rank), Some(file)) => Some((rank, file)),
        _ => None,
    };
    let incoming = match (rank_recv, file_recv) {
        (Some(rank), Some(file)) => Some((rank, file)),
        _ => None,
    };

    // whatever lands here is incomplete until proven otherwise
    if let Some((_, file)) = incoming {
        Meta::unlink(file);
    }

    let buf_size = ctx.mpi_buf_size();
    let crc_on_copy = ctx.config.crc_on_copy;

    // sidecar is read up front but sent after the payload, since the copy
    // may fill in the CRC
    let mut meta_send = match outgoing {
        Some((_, file)) => Meta::read(file).ok(),
        None => None,
    };

    let mut crc_send = crc32fast::Hasher::new();
    let mut crc_recv = crc32fast::Hasher::new();

    // a receive-only MOVE lands in a temp file first: the sender may be
    // another resident of this node reading the very path we are writing,
    // and it only deletes its source before the sidecar exchange below
    let mut recv_tmp: Option<PathBuf> = None;

    match mode {
        SwapMode::Copy => {
            let mut fd_send = match outgoing {
                Some((_, file)) => Some(File::open(file).unwrap_or_else(|err| {
                    ctx.abort(&format!("opening file for send: {:?} - {}", file, err))
                })),
                None => None,
            };
            let mut fd_recv = match incoming {
                Some((_, file)) => Some(
                    OpenOptions::new()
                        .write(true)
                        .create(true)
                        .truncate(true)
                        .open(file)
                        .unwrap_or_else(|err| {
                            ctx.abort(&format!("opening file for recv: {:?} - {}", file, err))
                        }),
                ),
                None => None,
            };

            let mut buf = vec![0u8; buf_size];
            let mut sending = outgoing.is_some();
            let mut receiving = incoming.is_some();
            while sending || receiving {
                if sending {
                    let (rank, file) = outgoing.unwrap();
                    let nread = read_chunk(ctx, fd_send.as_mut().unwrap(), &mut buf, file);
                    if crc_on_copy && nread > 0 {
                        crc_send.update(&buf[..nread]);
                    }
                    comm.send(rank, &buf[..nread])?;
                    if nread < buf_size {
                        sending = false;
                    }
                }

                if receiving {
                    let (rank, file) = incoming.unwrap();
                    let data = comm.recv(rank)?;
                    if crc_on_copy && !data.is_empty() {
                        crc_recv.update(&data);
                    }
                    write_chunk(ctx, fd_recv.as_mut().unwrap(), &data, file);
                    if data.len() < buf_size {
                        receiving = false;
                    }
                }
            }

            if let Some((_, file)) = outgoing {
                if crc_on_copy {
                    if let Some(meta) = meta_send.as_mut() {
                        if meta.crc32.is_none() {
                            meta.crc32 = Some(crc_send.clone().finalize());
                            meta.write(file)?;
                        }
                    }
                }
            }
        }
        SwapMode::Move => {
            // one descriptor serves both directions: reads walk the original
            // contents while writes overwrite from the front
            let (mut fd, filesize_send) = match (outgoing, incoming) {
                (Some((_, file)), _) => {
                    let size = fileio::file_size(file)?;
                    let fd = OpenOptions::new()
                        .read(true)
                        .write(true)
                        .open(file)
                        .unwrap_or_else(|err| {
                            ctx.abort(&format!("opening file for send/recv: {:?} - {}", file, err))
                        });
                    (Some(fd), size)
                }
                (None, Some((_, file))) => {
                    let mut tmp = file.as_os_str().to_owned();
                    tmp.push(".recv");
                    let tmp = PathBuf::from(tmp);
                    let fd = OpenOptions::new()
                        .write(true)
                        .create(true)
                        .truncate(true)
                        .open(&tmp)
                        .unwrap_or_else(|err| {
                            ctx.abort(&format!("opening file for recv: {:?} - {}", tmp, err))
                        });
                    recv_tmp = Some(tmp);
                    (Some(fd), 0)
                }
                (None, None) => (None, 0),
            };

            let mut buf = vec![0u8; buf_size];
            let mut sending = outgoing.is_some();
            let mut receiving = incoming.is_some();
            let mut read_pos: u64 = 0;
            let mut write_pos: u64 = 0;
            while sending || receiving {
                if sending {
                    let (rank, file) = outgoing.unwrap();
                    let count = ((filesize_send - read_pos) as usize).min(buf_size);
                    let fd = fd.as_mut().unwrap();
                    fd.seek(SeekFrom::Start(read_pos))?;
                    let nread = read_chunk(ctx, fd, &mut buf[..count], file);
                    if crc_on_copy && nread > 0 {
                        crc_send.update(&buf[..nread]);
                    }
                    read_pos += nread as u64;
                    comm.send(rank, &buf[..nread])?;
                    if filesize_send == read_pos && count < buf_size {
                        sending = false;
                    }
                }

                if receiving {
                    let (rank, file) = incoming.unwrap();
                    let data = comm.recv(rank)?;
                    if crc_on_copy && !data.is_empty() {
                        crc_recv.update(&data);
                    }
                    let fd = fd.as_mut().unwrap();
                    fd.seek(SeekFrom::Start(write_pos))?;
                    write_chunk(ctx, fd, &data, file);
                    write_pos += data.len() as u64;
                    if data.len() < buf_size {
                        receiving = false;
                    }
                }
            }

            match (outgoing, incoming) {
                (Some((_, src)), Some((_, dst))) => {
                    // the source now holds the received data; trim and rename
                    let fd = fd.take().unwrap();
                    fd.set_len(write_pos)?;
                    drop(fd);
                    std::fs::rename(src, dst)?;
                    Meta::unlink(src);
                }
                (Some((_, src)), None) => {
                    drop(fd.take());
                    std::fs::remove_file(src)?;
                    Meta::unlink(src);
                }
                (None, Some(_)) => drop(fd.take()),
                (None, None) => {}
            }

            if crc_on_copy && outgoing.is_some() {
                if let Some(meta) = meta_send.as_mut() {
                    if meta.crc32.is_none() {
                        // source is gone; the value still travels in the
                        // sidecar exchange below
                        meta.crc32 = Some(crc_send.clone().finalize());
                    }
                }
            }
        }
    }

    // exchange sidecar metadata and verify what we received
    let meta_hash = meta_send.as_ref().map(|m| m.to_hash()).unwrap_or_default();
    let send = rank_send.map(|rank| (rank, &meta_hash));
    let received = sendrecv_hash(comm, send, rank_recv)?;

    if let Some((_, file)) = incoming {
        // the peer's source is gone (or renamed) by now, the path is ours
        if let Some(tmp) = recv_tmp {
            std::fs::rename(&tmp, file)?;
        }

        let mut meta_recv = match received.as_ref().filter(|h| !h.is_empty()) {
            Some(hash) => Meta::from_hash(hash)?,
            None => {
                log::error!("no sidecar metadata received for {:?}", file);
                return Ok(false);
            }
        };

        let written = fileio::file_size(file)?;
        if !meta_recv.check_filesize(written) {
            log::error!(
                "received file {:?} has {} bytes, sidecar says {}",
                file,
                written,
                meta_recv.filesize
            );
            meta_recv.complete = false;
            ok = false;
        }

        if crc_on_copy {
            if let Some(expected) = meta_recv.crc32 {
                let crc = crc_recv.finalize();
                if crc != expected {
                    log::error!(
                        "crc mismatch on received file {:?} ({:#x} != {:#x})",
                        file,
                        crc,
                        expected
                    );
                    meta_recv.complete = false;
                    ok = false;
                }
            }
        }

        meta_recv.write(file)?;
    }

    Ok(ok)
}

fn read_chunk(ctx: &Context, fd: &mut File, buf: &mut [u8], file: &Path) -> usize {
    let mut total = 0;
    while total < buf.len() {
        match fd.read(&mut buf[total..]) {
            Ok(0) => break,
            Ok(n) => total += n,
            Err(err) if err.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(err) => ctx.abort(&format!("reading {:?} - {}", file, err)),
        }
    }
    total
}

fn write_chunk(ctx: &Context, fd: &mut File, data: &[u8], file: &Path) {
    if let Err(err) = fd.write_all(data) {
        ctx.abort(&format!("writing {:?} - {}", file, err));
    }
}
