// Copyright Andeya Lee 2024
//
// Use of this source code is governed by an MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT.

use crate::codec::{Codec, Decoder, Message};
use crate::compress::Compressor;
use crate::framing::{decode_payload, encode_message, Parser, RecvEncoding};
use crate::metadata::{CallContext, Metadata, CONTENT_TYPE, ENCODING};
use crate::status::Status;
use crate::stream::ServerStream;
use crate::transport::{Frame, FrameSink, FrameStream, Trailers, TransportStream};
use bytes::Bytes;
use futures::future::BoxFuture;
use futures::stream::BoxStream;
use futures::{FutureExt, SinkExt, StreamExt};
use std::sync::{Arc, Mutex, PoisonError};

/// How one stream encodes and decodes messages.
pub(crate) struct StreamSettings {
    pub codec: Codec,
    pub compressor: Option<Arc<dyn Compressor>>,
    pub recv_encoding: RecvEncoding,
    pub max_send_message_size: usize,
    pub max_receive_message_size: usize,
}

struct SendSide {
    sink: FrameSink,
    header_sent: bool,
    finished: bool,
}

#[derive(Default)]
struct PendingHeader {
    md: Metadata,
    sent: bool,
}

/// The server side of one stream.
pub(crate) struct RpcServerStream {
    ctx: CallContext,
    settings: StreamSettings,
    send: tokio::sync::Mutex<SendSide>,
    recv: tokio::sync::Mutex<Parser<BoxStream<'static, Result<Bytes, Status>>>>,
    header: Mutex<PendingHeader>,
    trailer: Mutex<Metadata>,
}

fn request_bytes(frames: FrameStream) -> BoxStream<'static, Result<Bytes, Status>> {
    frames
        .map(|frame| match frame {
            Ok(Frame::Data(chunk)) => Ok(chunk),
            Ok(_) => Err(Status::internal("unexpected header or trailer frame from the client")),
            Err(e) => Err(e),
        })
        .boxed()
}

impl RpcServerStream {
    pub(crate) fn new(ctx: CallContext, settings: StreamSettings, stream: TransportStream) -> Self {
        let TransportStream { sink, stream } = stream;
        Self {
            ctx,
            settings,
            send: tokio::sync::Mutex::new(SendSide {
                sink,
                header_sent: false,
                finished: false,
            }),
            recv: tokio::sync::Mutex::new(Parser::new(request_bytes(stream))),
            header: Mutex::new(PendingHeader::default()),
            trailer: Mutex::new(Metadata::new()),
        }
    }

    fn take_header(&self, extra: Option<Metadata>) -> Result<Metadata, Status> {
        let mut pending = self.header.lock().unwrap_or_else(PoisonError::into_inner);
        if pending.sent {
            return Err(Status::internal("response header was already sent"));
        }
        pending.sent = true;
        let mut md = std::mem::take(&mut pending.md);
        if let Some(extra) = extra {
            md.merge(&extra);
        }
        md.insert(CONTENT_TYPE, self.settings.codec.content_type());
        if let Some(compressor) = &self.settings.compressor {
            md.insert(ENCODING, compressor.name().to_owned());
        }
        Ok(md)
    }

    async fn write_header(&self, send: &mut SendSide, extra: Option<Metadata>) -> Result<(), Status> {
        let md = self.take_header(extra)?;
        send.header_sent = true;
        send.sink.send(Frame::Headers(md)).await
    }

    /// Ends the stream with `status` and the collected trailer.
    ///
    /// A failed call that never sent its header ends with the trailers alone.
    pub(crate) async fn finish(&self, status: Status) {
        let mut send = self.send.lock().await;
        if send.finished {
            return;
        }
        send.finished = true;
        if !send.header_sent && status.is_ok() {
            if let Err(e) = self.write_header(&mut send, None).await {
                tracing::debug!(error = %e, "sending the response header failed");
                return;
            }
        }
        let trailers = Trailers {
            status: status.to_wire(),
            metadata: std::mem::take(&mut *self.trailer.lock().unwrap_or_else(PoisonError::into_inner)),
        };
        let res = async {
            send.sink.send(Frame::Trailers(trailers)).await?;
            send.sink.close().await
        }
        .await;
        if let Err(e) = res {
            tracing::debug!(error = %e, "client went away before the status was sent");
        }
    }
}

impl ServerStream for RpcServerStream {
    fn context(&self) -> &CallContext {
        &self.ctx
    }

    fn set_header(&self, md: Metadata) -> Result<(), Status> {
        let mut pending = self.header.lock().unwrap_or_else(PoisonError::into_inner);
        if pending.sent {
            return Err(Status::internal("set_header called after the header was sent"));
        }
        pending.md.merge(&md);
        Ok(())
    }

    fn send_header(&self, md: Metadata) -> BoxFuture<'_, Result<(), Status>> {
        async move {
            let mut send = self.send.lock().await;
            if send.finished {
                return Err(Status::internal("send_header called after the stream finished"));
            }
            self.write_header(&mut send, Some(md)).await
        }
        .boxed()
    }

    fn set_trailer(&self, md: Metadata) {
        self.trailer.lock().unwrap_or_else(PoisonError::into_inner).merge(&md);
    }

    fn send_msg<'a>(&'a self, msg: &'a dyn Message) -> BoxFuture<'a, Result<(), Status>> {
        async move {
            let frame = encode_message(msg, self.settings.codec, self.settings.compressor.as_deref(), self.settings.max_send_message_size)?;
            let mut send = self.send.lock().await;
            if send.finished {
                return Err(Status::internal("send_msg called after the stream finished"));
            }
            if !send.header_sent {
                self.write_header(&mut send, None).await?;
            }
            tokio::select! {
                res = send.sink.send(Frame::Data(frame)) => res,
                st = self.ctx.done() => Err(st),
            }
        }
        .boxed()
    }

    fn recv_msg(&self, decoder: Decoder) -> BoxFuture<'_, Result<Option<Box<dyn Message>>, Status>> {
        async move {
            let mut parser = self.recv.lock().await;
            let max = self.settings.max_receive_message_size;
            let raw = tokio::select! {
                res = parser.recv_msg(max) => res?,
                st = self.ctx.done() => return Err(st),
            };
            match raw {
                Some(raw) => {
                    let payload = decode_payload(raw, &self.settings.recv_encoding, max)?;
                    decoder(self.settings.codec, &payload).map(Some)
                },
                None => Ok(None),
            }
        }
        .boxed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::decode_message;
    use crate::compress::Gzip;
    use crate::framing::encode_frame;
    use crate::status::Code;
    use crate::stream::ServerStreamExt;
    use futures::channel::mpsc;

    fn open(compressor: Option<Arc<dyn Compressor>>) -> (RpcServerStream, mpsc::Sender<Result<Frame, Status>>, mpsc::Receiver<Frame>) {
        let (req_tx, req_rx) = mpsc::channel(8);
        let (rep_tx, rep_rx) = mpsc::channel(8);
        let settings = StreamSettings {
            codec: Codec::Json,
            compressor,
            recv_encoding: RecvEncoding::Identity,
            max_send_message_size: 1024,
            max_receive_message_size: 1024,
        };
        let stream = TransportStream {
            sink: Box::pin(rep_tx.sink_map_err(|_| Status::unavailable("closed"))),
            stream: req_rx.boxed(),
        };
        (RpcServerStream::new(CallContext::background(), settings, stream), req_tx, rep_rx)
    }

    #[tokio::test]
    async fn test_header_goes_before_first_message_and_only_once() {
        let (stream, _req, mut replies) = open(Some(Arc::new(Gzip::default())));
        stream.set_header([("x-region", "eu")].into_iter().collect()).unwrap();
        stream.send(&7u32).await.unwrap();
        assert!(stream.set_header(Metadata::new()).is_err());
        assert_eq!(stream.send_header(Metadata::new()).await.unwrap_err().code(), Code::Internal);

        let Some(Frame::Headers(md)) = replies.next().await else { panic!("expected the header") };
        assert_eq!(md.get("x-region"), Some("eu"));
        assert_eq!(md.get(ENCODING), Some("gzip"));
        assert_eq!(md.get(CONTENT_TYPE), Some("application/meshcall+json"));
        assert!(matches!(replies.next().await, Some(Frame::Data(_))));
    }

    #[tokio::test]
    async fn test_failed_call_ends_with_trailers_only() {
        let (stream, _req, mut replies) = open(None);
        stream.set_trailer([("x-retry-after", "1s")].into_iter().collect());
        stream.finish(Status::not_found("missing")).await;
        stream.finish(Status::ok()).await;
        let Some(Frame::Trailers(t)) = replies.next().await else { panic!("expected trailers") };
        assert_eq!(Status::from_wire(t.status).code(), Code::NotFound);
        assert_eq!(t.metadata.get("x-retry-after"), Some("1s"));
        assert!(replies.next().await.is_none());
        assert_eq!(stream.send(&1u32).await.unwrap_err().code(), Code::Internal);
    }

    #[tokio::test]
    async fn test_recv_until_half_close() {
        let (stream, mut req, _replies) = open(None);
        let payload = Codec::Json.marshal("ping").unwrap();
        req.send(Ok(Frame::Data(encode_frame(&payload, false).unwrap()))).await.unwrap();
        drop(req);
        assert_eq!(stream.recv::<String>().await.unwrap().as_deref(), Some("ping"));
        assert!(stream.recv_msg(decode_message::<String>).await.unwrap().is_none());
    }
}
