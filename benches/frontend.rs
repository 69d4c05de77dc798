mod common;

use criterion::{Criterion, black_box, criterion_group, criterion_main};

use hek::lexer::Tokenizer;
use hek::parser::Parser;

fn drain_tokens(source: &str) -> usize {
    let mut tok = Tokenizer::new(source);
    let mut count = 0;
    while !tok.next().expect("tokenize").is_eof() {
        count += 1;
    }
    count
}

fn parse_all(source: &str) -> usize {
    let mut tok = Tokenizer::new(source);
    let mut count = 0;
    while !tok.peek().expect("tokenize").is_eof() {
        Parser::new(&mut tok).next_stmt().expect("parse");
        count += 1;
    }
    count
}

fn bench_frontend(c: &mut Criterion) {
    for (label, path) in common::workloads() {
        let source = common::load_source(&path);

        c.bench_function(&format!("frontend_tokenize_{label}"), |b| {
            b.iter(|| {
                let count = drain_tokens(black_box(&source));
                black_box(count);
            })
        });

        c.bench_function(&format!("frontend_tokenize_parse_{label}"), |b| {
            b.iter(|| {
                let count = parse_all(black_box(&source));
                black_box(count);
            })
        });
    }
}

criterion_group!(benches, bench_frontend);
criterion_main!(benches);
