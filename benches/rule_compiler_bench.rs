use chrono::NaiveDate;
use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion};
use edc_rules::cache::{CacheHandle, RuleCompiler};
use edc_rules::lexer::Lexer;
use edc_rules::parser::{parse_rule, Parser};
use edc_rules::predicate::CompiledValidator;
use edc_rules::rule::Rule;
use edc_rules::sql_compiler::{SqlCompiler, SqlDialect};
use edc_rules::value::{FieldValue, RecordContext};
use std::hint::black_box;

const CASES: &[(&str, &str, &str)] = &[
    ("range", "age", "age between 18 and 65"),
    ("required", "consent_date", "required unless status == 'Withdrawn'"),
    (
        "conditional",
        "pregnant",
        "if sex == 'M' then pregnant == 'No' else pregnant in (Yes, No, Unknown) endif",
    ),
    (
        "window",
        "visit_date",
        "visit_date within 60 days of baseline_date + 365",
    ),
    ("cross_visit", "weight", "weight <= previous.weight + 10 and weight > 0"),
];

fn rule(name: &str, field: &str, text: &str) -> Rule {
    Rule::new(name, "VS", field, text)
}

fn context() -> RecordContext {
    let mut record = RecordContext::new();
    record.insert("status".into(), "Enrolled".into());
    record.insert("sex".into(), "F".into());
    record.insert(
        "baseline_date".into(),
        NaiveDate::from_ymd_opt(2024, 1, 1).unwrap().into(),
    );
    record.insert("previous.weight".into(), 70_i64.into());
    record
}

// 基准测试：词法分析性能
fn benchmark_lexer(c: &mut Criterion) {
    let mut group = c.benchmark_group("lexer_performance");
    for (name, _, text) in CASES {
        group.bench_with_input(BenchmarkId::new("tokenize", name), text, |b, &text| {
            b.iter(|| {
                let tokens: Vec<_> = Lexer::new(black_box(text)).collect();
                black_box(tokens)
            })
        });
    }
    group.finish();
}

// 基准测试：语法分析性能
fn benchmark_parser(c: &mut Criterion) {
    let mut group = c.benchmark_group("parser_performance");
    for (name, _, text) in CASES {
        // 预先词法分析
        let tokens: Vec<_> = Lexer::new(text).collect();
        group.bench_with_input(BenchmarkId::new("parse", name), &tokens, |b, tokens| {
            b.iter(|| {
                let mut parser = Parser::new(black_box(tokens));
                black_box(parser.parse().expect("解析应该成功"))
            })
        });
    }
    group.finish();
}

// 基准测试：实时校验，目标是远低于 5ms
fn benchmark_realtime(c: &mut Criterion) {
    let record = context();
    let today = NaiveDate::from_ymd_opt(2025, 6, 1).unwrap();
    let values = [
        FieldValue::from(30_i64),
        FieldValue::Null,
        FieldValue::from("No"),
        FieldValue::from("2025-02-01"),
        FieldValue::from(75_i64),
    ];

    let mut group = c.benchmark_group("realtime_validation");
    for ((name, field, text), value) in CASES.iter().zip(values) {
        let rule = rule(name, field, text);
        let node = parse_rule(text).expect("解析应该成功");
        let validator = CompiledValidator::compile(&rule, &node, &rule.content_hash())
            .expect("编译应该成功");
        group.bench_with_input(BenchmarkId::new("validate", name), &value, |b, value| {
            b.iter(|| black_box(validator.validate_at(black_box(value), &record, today)))
        });
    }
    group.finish();
}

// 基准测试：SQL编译性能
fn benchmark_sql_compiler(c: &mut Criterion) {
    let mut group = c.benchmark_group("sql_compiler_performance");
    for dialect in [SqlDialect::Postgres, SqlDialect::Sqlite] {
        let compiler = SqlCompiler::new(dialect);
        for (name, field, text) in CASES {
            let rule = rule(name, field, text);
            let node = parse_rule(text).expect("解析应该成功");
            let id = format!("{:?}/{}", dialect, name);
            group.bench_with_input(BenchmarkId::new("compile", id), &node, |b, node| {
                b.iter(|| black_box(compiler.compile(&rule, black_box(node), "bench")))
            });
        }
    }
    group.finish();
}

// 基准测试：缓存重建，未修改的规则直接复用
fn benchmark_cache_rebuild(c: &mut Criterion) {
    let rules: Vec<Rule> = (0..200)
        .map(|i| {
            let (_, field, text) = CASES[i % CASES.len()];
            rule(&format!("R{:03}", i), field, text)
        })
        .collect();
    let compiler = RuleCompiler::default();

    let mut group = c.benchmark_group("cache_build");
    group.bench_function("cold_build", |b| {
        b.iter(|| black_box(compiler.build(black_box(&rules))))
    });

    let handle = CacheHandle::default();
    handle.rebuild(&compiler, &rules);
    group.bench_function("warm_rebuild", |b| {
        b.iter(|| black_box(handle.rebuild(&compiler, black_box(&rules))))
    });
    group.finish();
}

criterion_group!(
    benches,
    benchmark_lexer,
    benchmark_parser,
    benchmark_realtime,
    benchmark_sql_compiler,
    benchmark_cache_rebuild
);
criterion_main!(benches);
