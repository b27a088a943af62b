// Copyright Andeya Lee 2024
//
// Use of this source code is governed by an MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT.

use super::CallSettings;
use crate::codec::{Decoder, Message};
use crate::framing::{decode_payload, encode_message, Parser, RecvEncoding};
use crate::metadata::{CallContext, Metadata, ENCODING};
use crate::registry::Registries;
use crate::status::Status;
use crate::stream::{ClientStream, StreamDesc};
use crate::transport::{Frame, FrameSink, FrameStream, Trailers, TransportStream};
use bytes::Bytes;
use futures::future::BoxFuture;
use futures::{ready, FutureExt, SinkExt, Stream, StreamExt};
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, PoisonError};
use std::task::{Context, Poll};

/// Response frames seen as message bytes.
///
/// The header is captured on the way; the trailers end the byte stream.
struct ResponseFrames {
    frames: FrameStream,
    header: Option<Metadata>,
    trailers: Option<Trailers>,
    ended: bool,
}

impl ResponseFrames {
    async fn header(&mut self) -> Result<&Metadata, Status> {
        while self.header.is_none() {
            match self.frames.next().await {
                Some(Ok(Frame::Headers(md))) => self.header = Some(md),
                Some(Ok(Frame::Trailers(t))) => {
                    self.header = Some(Metadata::new());
                    self.trailers = Some(t);
                },
                Some(Ok(Frame::Data(_))) => return Err(Status::internal("received a message before the response header")),
                Some(Err(e)) => {
                    self.ended = true;
                    return Err(e);
                },
                None => {
                    self.ended = true;
                    return Err(Status::unavailable("stream ended before the response header"));
                },
            }
        }
        Ok(self.header.get_or_insert_with(Metadata::new))
    }
}

impl Stream for ResponseFrames {
    type Item = Result<Bytes, Status>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = &mut *self;
        if this.ended || this.trailers.is_some() {
            return Poll::Ready(None);
        }
        loop {
            match ready!(this.frames.poll_next_unpin(cx)) {
                Some(Ok(Frame::Data(chunk))) => return Poll::Ready(Some(Ok(chunk))),
                Some(Ok(Frame::Headers(md))) => {
                    if this.header.is_some() {
                        this.ended = true;
                        return Poll::Ready(Some(Err(Status::internal("received a second response header"))));
                    }
                    this.header = Some(md);
                },
                Some(Ok(Frame::Trailers(t))) => {
                    this.header.get_or_insert_with(Metadata::new);
                    this.trailers = Some(t);
                    return Poll::Ready(None);
                },
                Some(Err(e)) => {
                    this.ended = true;
                    return Poll::Ready(Some(Err(e)));
                },
                None => {
                    this.ended = true;
                    return Poll::Ready(Some(Err(Status::unavailable("stream terminated without a status"))));
                },
            }
        }
    }
}

struct SendSide {
    sink: FrameSink,
    closed: bool,
}

struct RecvSide {
    parser: Parser<ResponseFrames>,
    encoding: Option<RecvEncoding>,
    // the final outcome, once the stream has ended
    outcome: Option<Result<(), Status>>,
}

/// The client stream of one call.
pub(crate) struct RpcClientStream {
    ctx: CallContext,
    desc: StreamDesc,
    settings: Arc<CallSettings>,
    registries: Arc<Registries>,
    send: tokio::sync::Mutex<SendSide>,
    recv: tokio::sync::Mutex<RecvSide>,
    header: std::sync::Mutex<Option<Metadata>>,
    trailer: std::sync::Mutex<Metadata>,
}

impl RpcClientStream {
    pub(crate) fn new(ctx: CallContext, desc: StreamDesc, settings: Arc<CallSettings>, registries: Arc<Registries>, stream: TransportStream) -> Self {
        let TransportStream { sink, stream } = stream;
        Self {
            ctx,
            desc,
            settings,
            registries,
            send: tokio::sync::Mutex::new(SendSide { sink, closed: false }),
            recv: tokio::sync::Mutex::new(RecvSide {
                parser: Parser::new(ResponseFrames {
                    frames: stream,
                    header: None,
                    trailers: None,
                    ended: false,
                }),
                encoding: None,
                outcome: None,
            }),
            header: std::sync::Mutex::new(None),
            trailer: std::sync::Mutex::new(Metadata::new()),
        }
    }

    async fn with_context<T>(&self, fut: impl Future<Output = Result<T, Status>>) -> Result<T, Status> {
        tokio::select! {
            res = fut => res,
            st = self.ctx.done() => Err(st),
        }
    }

    async fn ensure_header(&self, recv: &mut RecvSide) -> Result<(), Status> {
        if recv.encoding.is_some() {
            return Ok(());
        }
        let header = recv.parser.get_mut().header().await?.clone();
        let compressors = &self.registries.compressors;
        recv.encoding = Some(RecvEncoding::resolve(header.get(ENCODING), |name| compressors.get(name)));
        *self.header.lock().unwrap_or_else(PoisonError::into_inner) = Some(header);
        Ok(())
    }

    /// Reads the next message payload, or the final status at end of stream.
    async fn recv_payload(&self, recv: &mut RecvSide) -> Result<Option<Bytes>, Status> {
        if let Some(outcome) = &recv.outcome {
            return outcome.clone().map(|_| None);
        }
        let res = self.read_payload(recv).await;
        match &res {
            Ok(Some(_)) => {},
            Ok(None) => recv.outcome = Some(Ok(())),
            Err(e) => recv.outcome = Some(Err(e.clone())),
        }
        res
    }

    async fn read_payload(&self, recv: &mut RecvSide) -> Result<Option<Bytes>, Status> {
        self.ensure_header(recv).await?;
        let max = self.settings.max_receive_message_size;
        if let Some(raw) = recv.parser.recv_msg(max).await? {
            let encoding = recv.encoding.as_ref().unwrap_or(&RecvEncoding::Identity);
            return decode_payload(raw, encoding, max).map(Some);
        }
        let trailers = recv.parser.get_mut().trailers.take().ok_or_else(|| Status::internal("stream ended without trailers"))?;
        *self.trailer.lock().unwrap_or_else(PoisonError::into_inner) = trailers.metadata;
        let status = Status::from_wire(trailers.status);
        if status.is_ok() {
            Ok(None)
        } else {
            Err(status)
        }
    }

    async fn recv_one(&self, decoder: Decoder) -> Result<Option<Box<dyn Message>>, Status> {
        let mut recv = self.recv.lock().await;
        let codec = self.settings.codec;
        if self.desc.server_streams {
            return match self.recv_payload(&mut recv).await? {
                Some(payload) => decoder(codec, &payload).map(Some),
                None => Ok(None),
            };
        }
        if recv.outcome.is_some() {
            return self.recv_payload(&mut recv).await.map(|_| None);
        }
        let Some(payload) = self.recv_payload(&mut recv).await? else {
            return Err(Status::internal("cardinality violation: expected a reply, got end of stream"));
        };
        let reply = decoder(codec, &payload)?;
        match self.recv_payload(&mut recv).await? {
            None => Ok(Some(reply)),
            Some(_) => {
                let err = Status::internal("cardinality violation: expected end of stream for a non server-streaming call, got another message");
                recv.outcome = Some(Err(err.clone()));
                Err(err)
            },
        }
    }
}

impl ClientStream for RpcClientStream {
    fn context(&self) -> &CallContext {
        &self.ctx
    }

    fn header(&self) -> BoxFuture<'_, Result<Metadata, Status>> {
        async move {
            if let Some(md) = self.header.lock().unwrap_or_else(PoisonError::into_inner).clone() {
                return Ok(md);
            }
            self.with_context(async {
                let mut recv = self.recv.lock().await;
                self.ensure_header(&mut recv).await?;
                Ok(recv.parser.get_ref().header.clone().unwrap_or_default())
            })
            .await
        }
        .boxed()
    }

    fn trailer(&self) -> Metadata {
        self.trailer.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    fn send_msg<'a>(&'a self, msg: &'a dyn Message) -> BoxFuture<'a, Result<(), Status>> {
        async move {
            let mut send = self.send.lock().await;
            if send.closed {
                return Err(Status::internal("send_msg called after close_send"));
            }
            let frame = encode_message(msg, self.settings.codec, self.settings.compressor.as_deref(), self.settings.max_send_message_size)?;
            self.with_context(send.sink.send(Frame::Data(frame))).await?;
            if !self.desc.client_streams {
                send.closed = true;
                send.sink.close().await?;
            }
            Ok(())
        }
        .boxed()
    }

    fn close_send(&self) -> BoxFuture<'_, Result<(), Status>> {
        async move {
            let mut send = self.send.lock().await;
            if send.closed {
                return Ok(());
            }
            send.closed = true;
            send.sink.close().await
        }
        .boxed()
    }

    fn recv_msg(&self, decoder: Decoder) -> BoxFuture<'_, Result<Option<Box<dyn Message>>, Status>> {
        self.with_context(self.recv_one(decoder)).boxed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{decode_message, Codec};
    use crate::compress::{Compressor, Gzip};
    use crate::framing::encode_frame;
    use crate::status::Code;
    use crate::stream::ClientStreamExt;
    use futures::channel::mpsc;

    struct Peer {
        // frames the client sent
        requests: mpsc::Receiver<Frame>,
        // frames for the client
        replies: mpsc::Sender<Result<Frame, Status>>,
    }

    impl Peer {
        async fn reply(&mut self, frame: Frame) {
            self.replies.send(Ok(frame)).await.unwrap();
        }

        async fn reply_msg(&mut self, text: &str) {
            let payload = Codec::Bincode.marshal(text).unwrap();
            self.reply(Frame::Data(encode_frame(&payload, false).unwrap())).await;
        }

        async fn finish(&mut self, status: Status) {
            self.reply(Frame::Trailers(Trailers {
                status: status.to_wire(),
                metadata: [("x-cost", "3")].into_iter().collect(),
            }))
            .await;
        }
    }

    fn open(desc: StreamDesc) -> (RpcClientStream, Peer) {
        let (req_tx, req_rx) = mpsc::channel(8);
        let (rep_tx, rep_rx) = mpsc::channel(8);
        let settings = Arc::new(CallSettings::default());
        let stream = TransportStream {
            sink: Box::pin(req_tx.sink_map_err(|_| Status::unavailable("closed"))),
            stream: rep_rx.boxed(),
        };
        let client = RpcClientStream::new(CallContext::background(), desc, settings, Arc::new(Registries::new()), stream);
        (client, Peer { requests: req_rx, replies: rep_tx })
    }

    #[tokio::test]
    async fn test_unary_reply_then_trailers() {
        let (client, mut peer) = open(StreamDesc::unary("Say"));
        client.send(&"hi".to_owned()).await.unwrap();
        assert!(matches!(peer.requests.next().await, Some(Frame::Data(_))));
        // send side closed after the only request
        assert!(peer.requests.next().await.is_none());

        peer.reply(Frame::Headers(Metadata::new())).await;
        peer.reply_msg("hello").await;
        peer.finish(Status::ok()).await;
        assert_eq!(client.recv::<String>().await.unwrap().as_deref(), Some("hello"));
        assert_eq!(client.trailer().get("x-cost"), Some("3"));
        assert!(client.recv::<String>().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_send_after_close_is_internal() {
        let (client, _peer) = open(StreamDesc::unary("Say"));
        client.send(&"one".to_owned()).await.unwrap();
        let err = client.send(&"two".to_owned()).await.unwrap_err();
        assert_eq!(err.code(), Code::Internal);

        let (client, _peer) = open(StreamDesc::client_streaming("Upload"));
        client.close_send().await.unwrap();
        client.close_send().await.unwrap();
        assert_eq!(client.send(&"late".to_owned()).await.unwrap_err().code(), Code::Internal);
    }

    #[tokio::test]
    async fn test_extra_unary_reply_is_internal() {
        let (client, mut peer) = open(StreamDesc::unary("Say"));
        peer.reply(Frame::Headers(Metadata::new())).await;
        peer.reply_msg("one").await;
        peer.reply_msg("two").await;
        peer.finish(Status::ok()).await;
        let err = client.recv::<String>().await.unwrap_err();
        assert_eq!(err.code(), Code::Internal);
        assert!(err.message().contains("cardinality"));
    }

    #[tokio::test]
    async fn test_unary_without_reply_is_internal_and_error_status_wins() {
        let (client, mut peer) = open(StreamDesc::unary("Say"));
        peer.reply(Frame::Headers(Metadata::new())).await;
        peer.finish(Status::ok()).await;
        assert_eq!(client.recv::<String>().await.unwrap_err().code(), Code::Internal);

        let (client, mut peer) = open(StreamDesc::unary("Say"));
        peer.finish(Status::not_found("no such greeting")).await;
        let err = client.recv::<String>().await.unwrap_err();
        assert_eq!(err.code(), Code::NotFound);
        assert_eq!(err.message(), "no such greeting");
        // the outcome is sticky
        assert_eq!(client.recv::<String>().await.unwrap_err().code(), Code::NotFound);
    }

    #[tokio::test]
    async fn test_server_stream_and_compressed_replies() {
        let (client, mut peer) = open(StreamDesc::server_streaming("List"));
        peer.reply(Frame::Headers([(ENCODING, "gzip")].into_iter().collect())).await;
        let gz = Gzip::default();
        for text in ["a", "b"] {
            let payload = gz.compress(&Codec::Bincode.marshal(text).unwrap()).unwrap();
            peer.reply(Frame::Data(encode_frame(&payload, true).unwrap())).await;
        }
        peer.finish(Status::ok()).await;
        assert_eq!(client.header().await.unwrap().get(ENCODING), Some("gzip"));
        assert_eq!(client.recv::<String>().await.unwrap().as_deref(), Some("a"));
        assert_eq!(client.recv::<String>().await.unwrap().as_deref(), Some("b"));
        assert!(client.recv::<String>().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_truncated_stream_is_unavailable() {
        let (client, mut peer) = open(StreamDesc::server_streaming("List"));
        peer.reply(Frame::Headers(Metadata::new())).await;
        drop(peer);
        let err = client.recv_msg(decode_message::<String>).await.unwrap_err();
        assert_eq!(err.code(), Code::Unavailable);
    }

    #[tokio::test(start_paused = true)]
    async fn test_recv_honors_deadline() {
        let (req_tx, _req_rx) = mpsc::channel(1);
        let (_rep_tx, rep_rx) = mpsc::channel::<Result<Frame, Status>>(1);
        let stream = TransportStream {
            sink: Box::pin(req_tx.sink_map_err(|_| Status::unavailable("closed"))),
            stream: rep_rx.boxed(),
        };
        let ctx = CallContext::background().with_timeout(std::time::Duration::from_millis(50));
        let client = RpcClientStream::new(ctx, StreamDesc::unary("Say"), Arc::new(CallSettings::default()), Arc::new(Registries::new()), stream);
        assert_eq!(client.recv::<String>().await.unwrap_err().code(), Code::DeadlineExceeded);
    }
}
