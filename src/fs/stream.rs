//! Streaming object reader and writer / 对象流式读写
//!
//! `ObjectReader` turns ranged GETs into an `AsyncRead`. `ObjectWriter` feeds
//! parts through a bounded channel to a background task that runs the
//! multipart upload; small objects fall back to a single PUT.

use std::future::Future;
use std::io;
use std::ops::Range;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use bytes::{Bytes, BytesMut};
use futures::stream::{self, FuturesUnordered, Stream, StreamExt};
use tokio::io::AsyncWrite;
use tokio::sync::{mpsc, oneshot};
use tokio_util::io::StreamReader;

use super::cache::DirCache;
use super::path::TosPath;
use crate::error::{Result, TosfsError};
use crate::retry::RetryPolicy;
use crate::storage::{CompletedPart, ObjectStore, ProgressCallback};

/// Parts kept in memory between writer and upload task / 内存中最多保留的分片数
const MAX_BUFFER_CHUNKS: usize = 2;
const CONCURRENT_UPLOADS: usize = 2;

pub type ObjectReader = StreamReader<Pin<Box<dyn Stream<Item = io::Result<Bytes>> + Send>>, Bytes>;

/// AsyncRead over ranged GETs of `block_size` bytes / 基于范围读取的流
pub fn object_reader<S: ObjectStore>(
    store: Arc<S>,
    retry: RetryPolicy,
    path: TosPath,
    range: Range<u64>,
    block_size: u64,
) -> ObjectReader {
    let block_size = block_size.max(1);
    let end = range.end;
    let blocks = stream::try_unfold(range.start, move |pos| {
        let store = store.clone();
        let retry = retry.clone();
        let path = path.clone();
        async move {
            if pos >= end {
                return Ok::<_, io::Error>(None);
            }
            let stop = (pos + block_size).min(end);
            let data = retry
                .run("get_object", || store.get_object(&path.bucket, &path.key, Some(pos..stop)))
                .await
                .map_err(io::Error::from)?;
            if data.is_empty() {
                return Ok(None);
            }
            let next = pos + data.len() as u64;
            Ok(Some((data, next)))
        }
    });
    let blocks: Pin<Box<dyn Stream<Item = io::Result<Bytes>> + Send>> = Box::pin(blocks);
    StreamReader::new(blocks)
}

/// 分片数据
enum ChunkData {
    Part { part_number: u32, data: Bytes },
    /// Whole object, no part was sent / 整个对象，单次上传
    Single(Bytes),
    Complete,
}

/// Where the background upload writes / 后台上传目标
pub(crate) struct UploadTarget<S: ObjectStore> {
    pub store: Arc<S>,
    pub retry: RetryPolicy,
    pub path: TosPath,
    pub cache: Arc<DirCache>,
    pub size_hint: Option<u64>,
    pub progress: Option<ProgressCallback>,
}

/// Open a writer whose upload runs in a background task / 打开后台上传的写入器
pub(crate) fn object_writer<S: ObjectStore>(target: UploadTarget<S>, part_size: usize) -> ObjectWriter {
    let (tx, rx) = mpsc::channel::<ChunkData>(MAX_BUFFER_CHUNKS);
    let (result_tx, result_rx) = oneshot::channel::<Result<()>>();

    tokio::spawn(async move {
        let result = upload_task(&target, rx).await;
        if result.is_ok() {
            target.cache.invalidate(&target.path);
        }
        let _ = result_tx.send(result);
    });

    ObjectWriter {
        tx: Some(tx),
        result_rx: Some(result_rx),
        buffer: BytesMut::with_capacity(part_size),
        part_size: part_size.max(1),
        part_number: 1,
        pending_chunk: None,
        shutdown_state: ShutdownState::NotStarted,
    }
}

async fn upload_task<S: ObjectStore>(target: &UploadTarget<S>, mut rx: mpsc::Receiver<ChunkData>) -> Result<()> {
    let mut upload_id: Option<String> = None;
    let result = run_upload(target, &mut rx, &mut upload_id).await;
    if let (Err(e), Some(id)) = (&result, &upload_id) {
        tracing::warn!("Multipart upload of {} failed, aborting: {}", target.path, e);
        let aborted = target
            .retry
            .run("abort_multipart_upload", || {
                target.store.abort_multipart_upload(&target.path.bucket, &target.path.key, id)
            })
            .await;
        if let Err(abort_err) = aborted {
            tracing::error!("Abort of upload {} for {} failed: {}", id, target.path, abort_err);
        }
    }
    result
}

type PartTask = tokio::task::JoinHandle<Result<(CompletedPart, u64)>>;

async fn run_upload<S: ObjectStore>(
    target: &UploadTarget<S>,
    rx: &mut mpsc::Receiver<ChunkData>,
    upload_id: &mut Option<String>,
) -> Result<()> {
    let mut pending: FuturesUnordered<PartTask> = FuturesUnordered::new();
    let result = drive_parts(target, rx, upload_id, &mut pending).await;
    if result.is_err() && !pending.is_empty() {
        // 取消仍在上传的分片，再中止上传
        tracing::debug!("Cancelling {} in-flight parts of {}", pending.len(), target.path);
        for task in pending.iter() {
            task.abort();
        }
        while pending.next().await.is_some() {}
    }
    result
}

async fn drive_parts<S: ObjectStore>(
    target: &UploadTarget<S>,
    rx: &mut mpsc::Receiver<ChunkData>,
    upload_id: &mut Option<String>,
    pending: &mut FuturesUnordered<PartTask>,
) -> Result<()> {
    let bucket = target.path.bucket.as_str();
    let key = target.path.key.as_str();
    let mut completed: Vec<CompletedPart> = Vec::new();
    let mut uploaded = 0u64;

    let mut record = |joined: std::result::Result<Result<(CompletedPart, u64)>, tokio::task::JoinError>,
                      completed: &mut Vec<CompletedPart>|
     -> Result<()> {
        let (part, size) = joined.map_err(|e| TosfsError::tosfs(format!("upload task failed: {}", e)))??;
        completed.push(part);
        uploaded += size;
        if let Some(progress) = &target.progress {
            progress(uploaded, target.size_hint.unwrap_or(uploaded));
        }
        Ok(())
    };

    loop {
        // 并发数已满，等待一个任务完成
        if pending.len() >= CONCURRENT_UPLOADS {
            if let Some(joined) = pending.next().await {
                record(joined, &mut completed)?;
            }
            continue;
        }

        match rx.recv().await {
            Some(ChunkData::Single(data)) => {
                let size = data.len() as u64;
                target
                    .retry
                    .run("put_object", || target.store.put_object(bucket, key, data.clone()))
                    .await?;
                if let Some(progress) = &target.progress {
                    progress(size, target.size_hint.unwrap_or(size));
                }
                tracing::debug!("Uploaded {} in a single request ({} bytes)", target.path, size);
                return Ok(());
            }
            Some(ChunkData::Part { part_number, data }) => {
                let id = match upload_id {
                    Some(id) => id.clone(),
                    None => {
                        let id = target
                            .retry
                            .run("create_multipart_upload", || target.store.create_multipart_upload(bucket, key))
                            .await?;
                        tracing::debug!("Multipart upload started: {} upload_id={}", target.path, id);
                        *upload_id = Some(id.clone());
                        id
                    }
                };
                let store = target.store.clone();
                let retry = target.retry.clone();
                let bucket = bucket.to_string();
                let key = key.to_string();
                pending.push(tokio::spawn(async move {
                    let size = data.len() as u64;
                    tracing::debug!("Uploading part {} of {}/{} ({} bytes)", part_number, bucket, key, size);
                    let part = retry
                        .run("upload_part", || store.upload_part(&bucket, &key, &id, part_number, data.clone()))
                        .await?;
                    Ok((part, size))
                }));
            }
            Some(ChunkData::Complete) => break,
            None => {
                return Err(TosfsError::tosfs(format!(
                    "writer for {} dropped before shutdown",
                    target.path
                )));
            }
        }
    }

    // 等待所有剩余任务完成
    while let Some(joined) = pending.next().await {
        record(joined, &mut completed)?;
    }

    let Some(id) = upload_id.clone() else {
        // nothing was written and no single part was sent
        return target
            .retry
            .run("put_object", || target.store.put_object(bucket, key, Bytes::new()))
            .await;
    };

    completed.sort_by_key(|p| p.part_number);
    target
        .retry
        .run("complete_multipart_upload", || {
            target
                .store
                .complete_multipart_upload(bucket, key, &id, completed.clone())
        })
        .await?;
    tracing::debug!("Multipart upload completed: {} ({} parts)", target.path, completed.len());
    Ok(())
}

/// Object writer, one part of `part_size` in flight per channel slot / 对象写入器
pub struct ObjectWriter {
    tx: Option<mpsc::Sender<ChunkData>>,
    result_rx: Option<oneshot::Receiver<Result<()>>>,
    buffer: BytesMut,
    part_size: usize,
    part_number: u32,
    pending_chunk: Option<ChunkData>,
    shutdown_state: ShutdownState,
}

#[derive(Clone, Copy, PartialEq)]
enum ShutdownState {
    NotStarted,
    SendingRemainder,
    SendingComplete,
    Done,
}

fn channel_closed() -> io::Error {
    io::Error::new(io::ErrorKind::BrokenPipe, "upload task stopped")
}

impl ObjectWriter {
    /// Try to hand a chunk to the upload task; keeps it when the channel is full
    fn send_chunk(&mut self, cx: &mut Context<'_>, chunk: ChunkData) -> Poll<io::Result<()>> {
        let Some(tx) = self.tx.as_ref() else {
            return Poll::Ready(Err(channel_closed()));
        };
        match tx.try_send(chunk) {
            Ok(()) => Poll::Ready(Ok(())),
            Err(mpsc::error::TrySendError::Full(chunk)) => {
                self.pending_chunk = Some(chunk);
                cx.waker().wake_by_ref();
                Poll::Pending
            }
            Err(mpsc::error::TrySendError::Closed(_)) => Poll::Ready(Err(channel_closed())),
        }
    }

    fn close_channel(&mut self) {
        self.tx = None;
        self.pending_chunk = None;
    }

    fn flush_pending(&mut self, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.pending_chunk.take() {
            Some(chunk) => self.send_chunk(cx, chunk),
            None => Poll::Ready(Ok(())),
        }
    }
}

impl AsyncWrite for ObjectWriter {
    fn poll_write(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
        let this = self.get_mut();

        // 如果有待发送的分片，必须先发送完，不接受新数据
        match this.flush_pending(cx) {
            Poll::Ready(Ok(())) => {}
            Poll::Ready(Err(e)) => return Poll::Ready(Err(e)),
            Poll::Pending => return Poll::Pending,
        }

        let space_in_buffer = this.part_size.saturating_sub(this.buffer.len());
        let bytes_to_accept = buf.len().min(space_in_buffer.max(1));
        this.buffer.extend_from_slice(&buf[..bytes_to_accept]);

        if this.buffer.len() >= this.part_size {
            let data = this.buffer.split_to(this.part_size).freeze();
            let part_number = this.part_number;
            this.part_number += 1;
            if let Poll::Ready(Err(e)) = this.send_chunk(cx, ChunkData::Part { part_number, data }) {
                return Poll::Ready(Err(e));
            }
        }

        Poll::Ready(Ok(bytes_to_accept))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();

        loop {
            match this.flush_pending(cx) {
                Poll::Ready(Ok(())) => {}
                // the task stopped early, its own error is reported below
                Poll::Ready(Err(_)) => this.close_channel(),
                Poll::Pending => return Poll::Pending,
            }

            match this.shutdown_state {
                ShutdownState::NotStarted => {
                    this.shutdown_state = ShutdownState::SendingRemainder;
                }
                ShutdownState::SendingRemainder => {
                    let data = this.buffer.split().freeze();
                    if this.part_number == 1 {
                        // no part went out yet, a single PUT is enough
                        this.pending_chunk = Some(ChunkData::Single(data));
                        this.shutdown_state = ShutdownState::Done;
                    } else {
                        if !data.is_empty() {
                            let part_number = this.part_number;
                            this.part_number += 1;
                            this.pending_chunk = Some(ChunkData::Part { part_number, data });
                        }
                        this.shutdown_state = ShutdownState::SendingComplete;
                    }
                }
                ShutdownState::SendingComplete => {
                    this.pending_chunk = Some(ChunkData::Complete);
                    this.shutdown_state = ShutdownState::Done;
                }
                ShutdownState::Done => {
                    this.tx = None;
                    let Some(result_rx) = this.result_rx.as_mut() else {
                        return Poll::Ready(Ok(()));
                    };
                    let result = match Pin::new(result_rx).poll(cx) {
                        Poll::Ready(result) => result,
                        Poll::Pending => return Poll::Pending,
                    };
                    this.result_rx = None;
                    return match result {
                        Ok(Ok(())) => Poll::Ready(Ok(())),
                        Ok(Err(e)) => Poll::Ready(Err(io::Error::from(e))),
                        Err(_) => Poll::Ready(Err(io::Error::new(
                            io::ErrorKind::BrokenPipe,
                            "upload task ended abnormally",
                        ))),
                    };
                }
            }
        }
    }
}
