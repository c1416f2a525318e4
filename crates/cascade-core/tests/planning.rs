//! End-to-end planning over pre-rendered recipes.
//!
//! Covers:
//! - Downstream hops and the downstream cap
//! - Upstream closure and run modes
//! - Upload tasks inside jobs, strict and lenient targets
//! - Structural failures and idempotent replanning

use cascade_core::upload::{CommandTarget, ServerAuth, ServerTarget, TokenTarget};
use cascade_core::{
    ChangeSet, ImpactBounds, MatrixRow, NamedUploadTarget, PlanContext, PlanError, PlanOptions,
    PlanOutcome, PlanWarning, Planner, RejectedTarget, ResolvedDescription, RunMode,
    StaticRenderer, UploadConfig, UploadTarget,
};

fn desc(name: &str, build: &[&str]) -> ResolvedDescription {
    let mut desc = ResolvedDescription::new(name, "1.0", "h0_0", "linux-64");
    desc.requirements.build = build.iter().map(|s| s.to_string()).collect();
    desc.artifacts = vec![format!("{name}-1.0-h0_0.tar.bz2")];
    desc
}

fn renderer(units: &[(&str, &[&str])]) -> StaticRenderer {
    units
        .iter()
        .fold(StaticRenderer::new(), |r, (name, build)| r.with(*name, desc(name, build)))
}

fn linux() -> Vec<MatrixRow> {
    vec![MatrixRow::new("linux", "linux-64")]
}

fn bounds(steps: i64, max_downstream: i64) -> PlanOptions {
    PlanOptions {
        bounds: ImpactBounds {
            steps,
            max_downstream,
            test_only: false,
        },
        ..PlanOptions::default()
    }
}

fn plan_with(
    renderer: StaticRenderer,
    uploads: UploadConfig,
    options: PlanOptions,
    changed: &[&str],
) -> Result<PlanOutcome, PlanError> {
    let recipes = renderer.recipes();
    let context = PlanContext::new(renderer, linux())
        .with_uploads(uploads)
        .with_options(options);
    Planner::new(context).plan(&recipes, &ChangeSet::from_folders(changed))
}

fn job_names(outcome: &PlanOutcome) -> Vec<&str> {
    outcome.pipeline.jobs.iter().map(|j| j.name.as_str()).collect()
}

fn token(token: &str) -> NamedUploadTarget {
    NamedUploadTarget::new(
        "anaconda",
        UploadTarget::Token(TokenTarget {
            token: token.to_string(),
            user: None,
            label: None,
        }),
    )
}

fn uploads(targets: Vec<NamedUploadTarget>) -> UploadConfig {
    UploadConfig {
        targets,
        rejected: Vec::new(),
    }
}

// ---- Impact bounds ----

#[test]
fn one_step_pulls_in_direct_consumer() {
    let outcome = plan_with(
        renderer(&[("alpha", &["beta"]), ("beta", &[])]),
        UploadConfig::default(),
        bounds(1, -1),
        &["beta"],
    )
    .expect("plan");

    assert_eq!(
        job_names(&outcome),
        vec!["build-beta-1.0-h0_0-linux-64", "build-alpha-1.0-h0_0-linux-64"]
    );
    let alpha = outcome.pipeline.job("build-alpha-1.0-h0_0-linux-64").unwrap();
    assert_eq!(alpha.mode, RunMode::BuildAndTest);
    assert_eq!(alpha.passed, vec!["build-beta-1.0-h0_0-linux-64"]);
    assert_eq!(outcome.summary.graph_edges, 1);
    assert_eq!(outcome.summary.downstream_units, 1);
    assert!(outcome.warnings.is_empty());
}

#[test]
fn zero_steps_plans_seed_only() {
    let outcome = plan_with(
        renderer(&[("alpha", &["beta"]), ("beta", &[])]),
        UploadConfig::default(),
        bounds(0, -1),
        &["beta"],
    )
    .expect("plan");
    assert_eq!(job_names(&outcome), vec!["build-beta-1.0-h0_0-linux-64"]);
}

#[test]
fn downstream_cap_keeps_smallest_key_and_warns() {
    let outcome = plan_with(
        renderer(&[("s", &[]), ("d1", &["s"]), ("d2", &["s"]), ("d3", &["s"])]),
        UploadConfig::default(),
        bounds(-1, 1),
        &["s"],
    )
    .expect("plan");

    assert_eq!(
        job_names(&outcome),
        vec!["build-s-1.0-h0_0-linux-64", "build-d1-1.0-h0_0-linux-64"]
    );
    match outcome.warnings.as_slice() {
        [PlanWarning::Truncated(w)] => {
            assert_eq!(w.max_downstream, 1);
            assert_eq!(
                w.omitted,
                vec!["d2-1.0-h0_0-linux-64", "d3-1.0-h0_0-linux-64"]
            );
        }
        other => panic!("expected one truncation warning, got {other:?}"),
    }
}

#[test]
fn test_only_seed_still_builds_its_ancestors() {
    let mut options = bounds(0, -1);
    options.bounds.test_only = true;
    let outcome = plan_with(
        renderer(&[("app", &["lib"]), ("lib", &["zlib"]), ("zlib", &[])]),
        uploads(vec![token("abcd1234")]),
        options,
        &["app"],
    )
    .expect("plan");

    assert_eq!(
        job_names(&outcome),
        vec![
            "build-zlib-1.0-h0_0-linux-64",
            "build-lib-1.0-h0_0-linux-64",
            "test-app-1.0-h0_0-linux-64",
        ]
    );
    let app = outcome.pipeline.job("test-app-1.0-h0_0-linux-64").unwrap();
    assert_eq!(app.uploads().count(), 0, "test-only jobs never publish");
    let lib = outcome.pipeline.job("build-lib-1.0-h0_0-linux-64").unwrap();
    assert_eq!(lib.uploads().count(), 1);
}

// ---- Uploads ----

#[test]
fn token_task_is_named_by_token_suffix() {
    let outcome = plan_with(
        renderer(&[("beta", &[])]),
        uploads(vec![token("abcd1234")]),
        bounds(0, -1),
        &["beta"],
    )
    .expect("plan");

    let job = &outcome.pipeline.jobs[0];
    let names: Vec<&str> = job.steps.iter().map(|s| s.name()).collect();
    assert_eq!(names, vec!["build", "anaconda-1234"]);
    assert_eq!(outcome.summary.upload_tasks, 1);
}

#[test]
fn server_tasks_keep_scp_chmod_index_order() {
    let server = NamedUploadTarget::new(
        "mirror",
        UploadTarget::Server(ServerTarget {
            server: "pkgs.internal".to_string(),
            destination_path: "/channel/{subdir}".to_string(),
            auth: ServerAuth {
                user: "ci".to_string(),
                key_file: "mirror_key".to_string(),
            },
            port: 2222,
        }),
    );
    let outcome = plan_with(
        renderer(&[("beta", &[])]),
        uploads(vec![server]),
        bounds(0, -1),
        &["beta"],
    )
    .expect("plan");

    let uploads: Vec<&str> = outcome.pipeline.jobs[0]
        .uploads()
        .map(|t| t.name.as_str())
        .collect();
    assert_eq!(
        uploads,
        vec!["scp-pkgs.internal", "chmod-pkgs.internal", "index-pkgs.internal"]
    );
}

fn broken_command() -> NamedUploadTarget {
    NamedUploadTarget::new(
        "notify",
        UploadTarget::Commands(CommandTarget {
            commands: vec!["curl {webhook} -d {package}".to_string()],
        }),
    )
}

#[test]
fn strict_uploads_fail_on_bad_template() {
    let err = plan_with(
        renderer(&[("beta", &[])]),
        uploads(vec![token("abcd1234"), broken_command()]),
        bounds(0, -1),
        &["beta"],
    )
    .unwrap_err();
    assert!(matches!(err, PlanError::UploadConfig { ref target, .. } if target == "notify"));
}

#[test]
fn lenient_uploads_drop_only_the_bad_target() {
    let mut options = bounds(-1, -1);
    options.strict_uploads = false;
    let outcome = plan_with(
        renderer(&[("alpha", &["beta"]), ("beta", &[])]),
        uploads(vec![token("abcd1234"), broken_command()]),
        options,
        &["beta"],
    )
    .expect("plan");

    assert_eq!(outcome.rejected.len(), 1, "rejection is reported once per target");
    assert_eq!(outcome.rejected[0].target, "notify");
    for job in &outcome.pipeline.jobs {
        let names: Vec<&str> = job.uploads().map(|t| t.name.as_str()).collect();
        assert_eq!(names, vec!["anaconda-1234"]);
    }
}

#[test]
fn load_time_rejection_is_fatal_when_strict() {
    let config = UploadConfig {
        targets: vec![token("abcd1234")],
        rejected: vec![RejectedTarget {
            target: "odd".to_string(),
            error: PlanError::upload_config("odd", "unrecognized upload configuration"),
        }],
    };
    let err = plan_with(renderer(&[("beta", &[])]), config, bounds(0, -1), &["beta"]).unwrap_err();
    assert!(err.to_string().contains("odd"));
}

// ---- Structural failures ----

#[test]
fn cycle_aborts_planning() {
    let err = plan_with(
        renderer(&[("a", &["b"]), ("b", &["a"]), ("c", &[])]),
        UploadConfig::default(),
        bounds(0, -1),
        &["c"],
    )
    .unwrap_err();
    match err {
        PlanError::DependencyCycle { units } => {
            assert!(units.contains(&"a-1.0-h0_0-linux-64".to_string()));
            assert!(units.contains(&"b-1.0-h0_0-linux-64".to_string()));
        }
        other => panic!("expected a cycle, got {other}"),
    }
}

#[test]
fn duplicate_key_across_rows_aborts_planning() {
    let renderer = renderer(&[("beta", &[])]);
    let recipes = renderer.recipes();
    let rows = vec![
        MatrixRow::new("linux-a", "linux-64"),
        MatrixRow::new("linux-b", "linux-64"),
    ];
    let err = Planner::new(PlanContext::new(renderer, rows))
        .plan(&recipes, &ChangeSet::from_folders(["beta"]))
        .unwrap_err();
    assert!(err.is_structural());
    assert!(matches!(err, PlanError::DuplicateKey { .. }));
}

// ---- Determinism ----

#[test]
fn replanning_is_byte_identical() {
    let run = || {
        plan_with(
            renderer(&[("app", &["lib"]), ("lib", &[]), ("tool", &["lib"])]),
            uploads(vec![token("abcd1234")]),
            bounds(-1, -1),
            &["lib"],
        )
        .expect("plan")
    };
    let first = run();
    let second = run();
    assert_eq!(first.pipeline, second.pipeline);
    assert_eq!(
        serde_json::to_string(&first.pipeline).unwrap(),
        serde_json::to_string(&second.pipeline).unwrap()
    );
    assert_eq!(first.pipeline.digest().unwrap(), second.pipeline.digest().unwrap());
}

#[test]
fn unknown_changed_folder_is_a_warning() {
    let outcome = plan_with(
        renderer(&[("beta", &[])]),
        UploadConfig::default(),
        bounds(0, -1),
        &["beta", "docs"],
    )
    .expect("plan");
    assert_eq!(outcome.pipeline.len(), 1);
    assert_eq!(
        outcome.warnings,
        vec![PlanWarning::UnknownRecipe("docs".to_string())]
    );
}
