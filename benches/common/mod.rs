#![allow(dead_code)]
use std::fs;

pub const WORKLOADS: [(&str, &str); 2] = [
    ("loop", "tests/programs/bench_loop/program.hek"),
    ("fib", "tests/programs/fib/program.hek"),
];

pub fn workloads() -> Vec<(String, String)> {
    WORKLOADS
        .iter()
        .map(|(label, path)| (label.to_string(), path.to_string()))
        .collect()
}

pub fn load_source(path: &str) -> String {
    fs::read_to_string(path).unwrap_or_else(|err| panic!("read {path}: {err}"))
}

/// Computation-only variants of the fixture programs, so VM benches do not
/// spend their time writing to stdout.
pub const RUN_WORKLOADS: [(&str, &str); 2] = [
    (
        "loop",
        "let total = 0;\n\
         let n = 0;\n\
         loop {\n\
             if n == 200 { break };\n\
             total = total + n * n;\n\
             n = n + 1\n\
         }",
    ),
    (
        "fib",
        "fn fib(n) {\n\
             if n < 2 { return n };\n\
             return fib(n - 1) + fib(n - 2)\n\
         };\n\
         let result = fib(15)",
    ),
];
