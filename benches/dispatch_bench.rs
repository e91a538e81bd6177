//! Benchmarks for per-call dispatch overhead through the module ABI

use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};
use modhost::abi::{EntryPoints, RawRequest, RawResponse};
use modhost::host::ModuleInstance;
use modhost::http::{Request, Response};
use modhost::module::{self, Handler};

unsafe extern "C" fn noop(_: *const RawRequest, _: *mut RawResponse) {}

struct Echo;

impl Handler for Echo {
    fn init() -> anyhow::Result<Self> {
        Ok(Echo)
    }

    fn handle(&self, req: &module::Request<'_>, resp: &mut module::Response<'_>) {
        resp.set_status(200);
        resp.set_header("x-agent", req.header("user-agent").unwrap_or("-"))
            .ok();
        resp.write_str(req.uri());
    }
}

modhost::declare_module!(mod echo => Echo);

/// Host-side cost alone: admission gate plus handle construction and retire
fn bench_raw_dispatch(c: &mut Criterion) {
    let instance = ModuleInstance::from_entry_points("noop", EntryPoints::new(noop)).unwrap();
    let req = Request::new("GET", "/");

    c.bench_function("dispatch_noop", |b| {
        b.iter(|| {
            let mut resp = Response::new();
            instance.handle_request(black_box(&req), &mut resp).unwrap();
            black_box(resp)
        })
    });
}

/// Full round trip through the module SDK
fn bench_handler_dispatch(c: &mut Criterion) {
    let instance = ModuleInstance::from_entry_points("echo", echo::entry_points()).unwrap();
    let req = Request::new("GET", "/api/items?page=2").with_header("User-Agent", "bench/1");

    let mut group = c.benchmark_group("handler");
    group.throughput(Throughput::Elements(1));
    group.bench_function("echo", |b| {
        b.iter(|| {
            let mut resp = Response::new();
            instance.handle_request(black_box(&req), &mut resp).unwrap();
            black_box(resp)
        })
    });
    group.finish();
}

criterion_group!(benches, bench_raw_dispatch, bench_handler_dispatch);
criterion_main!(benches);
