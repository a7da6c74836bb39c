use std::hint::black_box;
use std::io::Write;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use criterion::{Criterion, Throughput, criterion_group, criterion_main};
use flate2::Compression;
use flate2::write::GzEncoder;
use futures_util::future::BoxFuture;
use futures_util::{StreamExt, stream};
use http::header::{CONTENT_ENCODING, CONTENT_TYPE, LOCATION};
use http::{HeaderMap, HeaderValue, StatusCode};
use reqflow::prelude::{Client, Readable};
use reqflow::transport::{
    Connection, OutboundBody, RequestHead, Transport, TransportError, TransportResponse,
};
use tokio::runtime::Runtime;
use url::Url;

/// Answers `/hop/N` with a redirect to `/hop/N-1` and everything else with
/// the canned body, without touching the network.
struct InMemory {
    body: Bytes,
    encoding: Option<&'static str>,
}

impl Transport for InMemory {
    fn connect<'a>(
        &'a self,
        _url: &'a Url,
    ) -> BoxFuture<'a, Result<Box<dyn Connection>, TransportError>> {
        let connection: Box<dyn Connection> = Box::new(InMemoryConnection {
            body: self.body.clone(),
            encoding: self.encoding,
        });
        Box::pin(async move { Ok(connection) })
    }
}

struct InMemoryConnection {
    body: Bytes,
    encoding: Option<&'static str>,
}

impl Connection for InMemoryConnection {
    fn send(
        self: Box<Self>,
        head: RequestHead,
        _body: OutboundBody,
    ) -> BoxFuture<'static, Result<TransportResponse, TransportError>> {
        Box::pin(async move {
            let mut headers = HeaderMap::new();
            let remaining = head
                .url
                .path()
                .strip_prefix("/hop/")
                .and_then(|count| count.parse::<u32>().ok())
                .filter(|count| *count > 0);
            if let Some(remaining) = remaining {
                let location = format!("/hop/{}", remaining - 1);
                headers.insert(
                    LOCATION,
                    HeaderValue::from_str(&location).expect("location header"),
                );
                return Ok(TransportResponse {
                    status: StatusCode::FOUND,
                    headers,
                    body: stream::empty().boxed(),
                });
            }

            headers.insert(CONTENT_TYPE, HeaderValue::from_static("text/plain"));
            if let Some(encoding) = self.encoding {
                headers.insert(CONTENT_ENCODING, HeaderValue::from_static(encoding));
            }
            let chunks: Vec<_> = self
                .body
                .chunks(16 * 1024)
                .map(|chunk| Ok(Bytes::copy_from_slice(chunk)))
                .collect();
            Ok(TransportResponse {
                status: StatusCode::OK,
                headers,
                body: stream::iter(chunks).boxed(),
            })
        })
    }
}

fn benchmark_runtime() -> Runtime {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .expect("build benchmark runtime")
}

fn benchmark_client(body: Bytes, encoding: Option<&'static str>) -> Client {
    Client::builder()
        .base_url("http://bench.test")
        .transport(Arc::new(InMemory { body, encoding }))
        .build()
}

fn gzip_bytes(data: &[u8]) -> Vec<u8> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(data).expect("write gzip source bytes");
    encoder.finish().expect("finish gzip stream")
}

fn bench_redirect_chain(c: &mut Criterion) {
    let runtime = benchmark_runtime();
    let client = benchmark_client(Bytes::from_static(b"ok"), None);

    let mut group = c.benchmark_group("redirect_chain");
    group.bench_function("direct", |b| {
        b.iter(|| {
            let response = runtime
                .block_on(client.get("/hop/0").send())
                .expect("direct request");
            black_box(response.payload().len());
        });
    });
    group.bench_function("five_hops", |b| {
        b.iter(|| {
            let response = runtime
                .block_on(client.get("/hop/5").send())
                .expect("redirected request");
            black_box(response.redirect_chain().len());
        });
    });
    group.finish();
}

fn bench_gzip_body(c: &mut Criterion) {
    const PAYLOAD_BYTES: usize = 256 * 1024;
    let text = "lifecycle benchmark payload ".repeat(PAYLOAD_BYTES / 28);
    let runtime = benchmark_runtime();
    let plain = benchmark_client(Bytes::from(text.clone()), None);
    let compressed = benchmark_client(Bytes::from(gzip_bytes(text.as_bytes())), Some("gzip"));

    let mut group = c.benchmark_group("response_256k");
    group.throughput(Throughput::Bytes(text.len() as u64));
    group.bench_function("identity", |b| {
        b.iter(|| {
            let response = runtime
                .block_on(plain.get("/body").send())
                .expect("plain request");
            black_box(response.payload().len());
        });
    });
    group.bench_function("gzip", |b| {
        b.iter(|| {
            let response = runtime
                .block_on(compressed.get("/body").send())
                .expect("gzip request");
            black_box(response.payload().len());
        });
    });
    group.finish();
}

criterion_group!(
    name = benches;
    config = Criterion::default()
        .warm_up_time(Duration::from_secs(1))
        .measurement_time(Duration::from_secs(5));
    targets = bench_redirect_chain, bench_gzip_body
);
criterion_main!(benches);
