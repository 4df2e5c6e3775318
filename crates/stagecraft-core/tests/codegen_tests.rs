use pretty_assertions::assert_eq;
use stagecraft_core::{
    ArtifactKey, ArtifactStatus, CancellationToken, FileOutcome, GenerationError,
    PipelineController, PipelineError, ProjectId, Stage,
};
use stagecraft_test_utils::{
    cached_config, requirements, setup_controller, test_config, ScriptedGenerator, ABC_FILES,
};
use std::sync::Arc;
use std::time::Duration;

async fn scaffolded(controller: &PipelineController) -> ProjectId {
    let id = ProjectId::new("demo").unwrap();
    controller.store().create_project(&id).unwrap();
    controller.submit_brief(&id, "a todo app").unwrap();
    for stage in [Stage::RequirementsText, Stage::RequirementsStructured, Stage::Scaffold] {
        controller.advance(&id, stage, None).await.unwrap();
    }
    id
}

fn file_versions(
    controller: &PipelineController,
    id: &ProjectId,
    path: &str,
) -> Vec<(u32, ArtifactStatus)> {
    controller
        .store()
        .history(&ArtifactKey::file(id.clone(), path))
        .unwrap()
        .iter()
        .map(|a| (a.version, a.status))
        .collect()
}

#[tokio::test]
async fn every_scaffold_leaf_gets_its_own_lineage() {
    let generator = Arc::new(ScriptedGenerator::default());
    let controller = setup_controller(generator.clone(), test_config());
    let id = scaffolded(&controller).await;

    let aggregate = controller.advance(&id, Stage::CodeGen, None).await.unwrap();
    assert_eq!(aggregate.status, ArtifactStatus::Succeeded);

    let manifest = controller.code_gen_manifest(&id).unwrap().unwrap();
    let paths: Vec<_> = manifest.files.iter().map(|f| f.path.as_str()).collect();
    assert_eq!(paths, vec!["app/a.py", "app/b.py", "app/c.py"]);
    assert!(manifest.files.iter().all(|f| f.outcome == FileOutcome::Generated));

    let code = controller
        .store()
        .current(&ArtifactKey::file(id.clone(), "app/a.py"))
        .unwrap()
        .unwrap();
    assert!(code.payload.starts_with("# app/a.py"));
    assert!(!code.payload.contains("```"));
    assert_eq!(generator.calls_for(Stage::CodeGen), 3);
}

#[tokio::test]
async fn retry_after_partial_failure_regenerates_only_failed_files() {
    let generator = Arc::new(ScriptedGenerator::default());
    let controller = setup_controller(generator.clone(), test_config());
    let id = scaffolded(&controller).await;

    generator.fail_file("app/b.py", GenerationError::Transient("overloaded".into()), 2);
    let first = controller.advance(&id, Stage::CodeGen, None).await.unwrap();
    assert_eq!(first.status, ArtifactStatus::PartiallyFailed);
    let manifest = controller.code_gen_manifest(&id).unwrap().unwrap();
    assert_eq!(manifest.failed_paths(), vec!["app/b.py"]);
    assert_eq!(
        file_versions(&controller, &id, "app/b.py"),
        vec![(1, ArtifactStatus::Failed)]
    );

    let state = controller.status(&id).unwrap();
    let line = state.stage(Stage::CodeGen).unwrap();
    assert_eq!(line.current_version, None);
    assert_eq!(line.latest_status, Some(ArtifactStatus::PartiallyFailed));

    let a_before = controller
        .store()
        .current(&ArtifactKey::file(id.clone(), "app/a.py"))
        .unwrap()
        .unwrap();

    let second = controller.advance(&id, Stage::CodeGen, None).await.unwrap();
    assert_eq!(second.status, ArtifactStatus::Succeeded);
    assert_eq!(second.version, 2);

    assert_eq!(
        file_versions(&controller, &id, "app/a.py"),
        vec![(1, ArtifactStatus::Succeeded)]
    );
    assert_eq!(
        file_versions(&controller, &id, "app/b.py"),
        vec![(1, ArtifactStatus::Failed), (2, ArtifactStatus::Succeeded)]
    );
    assert_eq!(
        file_versions(&controller, &id, "app/c.py"),
        vec![(1, ArtifactStatus::Succeeded)]
    );

    let a_after = controller
        .store()
        .current(&ArtifactKey::file(id.clone(), "app/a.py"))
        .unwrap()
        .unwrap();
    assert_eq!(a_after, a_before);

    let outcomes: Vec<_> = controller
        .code_gen_manifest(&id)
        .unwrap()
        .unwrap()
        .files
        .iter()
        .map(|f| (f.path.clone(), f.outcome, f.version))
        .collect();
    assert_eq!(
        outcomes,
        vec![
            ("app/a.py".to_string(), FileOutcome::Reused, Some(1)),
            ("app/b.py".to_string(), FileOutcome::Generated, Some(2)),
            ("app/c.py".to_string(), FileOutcome::Reused, Some(1)),
        ]
    );
    assert_eq!(generator.file_calls("app/a.py"), 1);
    assert_eq!(generator.file_calls("app/b.py"), 3);
}

#[tokio::test]
async fn every_file_failing_fails_the_aggregate() {
    let generator = Arc::new(ScriptedGenerator::default());
    let controller = setup_controller(generator.clone(), test_config());
    let id = scaffolded(&controller).await;

    for path in ["app/a.py", "app/b.py", "app/c.py"] {
        generator.fail_file(path, GenerationError::Permanent("refused".into()), 1);
    }
    let aggregate = controller.advance(&id, Stage::CodeGen, None).await.unwrap();
    assert_eq!(aggregate.status, ArtifactStatus::Failed);
    assert!(aggregate.diagnostic.is_some());
}

#[tokio::test]
async fn empty_file_output_is_invalid_and_unversioned() {
    let generator = Arc::new(ScriptedGenerator::default());
    let controller = setup_controller(generator.clone(), test_config());
    let id = scaffolded(&controller).await;

    generator.respond_file("app/c.py", "```python\n```");
    let aggregate = controller.advance(&id, Stage::CodeGen, None).await.unwrap();
    assert_eq!(aggregate.status, ArtifactStatus::PartiallyFailed);
    assert!(file_versions(&controller, &id, "app/c.py").is_empty());

    let manifest = controller.code_gen_manifest(&id).unwrap().unwrap();
    let c = manifest.files.iter().find(|f| f.path == "app/c.py").unwrap();
    assert_eq!(c.outcome, FileOutcome::Invalid);
    assert_eq!(c.version, None);
}

#[tokio::test]
async fn feedback_regenerates_every_file() {
    let generator = Arc::new(ScriptedGenerator::default());
    let controller = setup_controller(generator.clone(), test_config());
    let id = scaffolded(&controller).await;

    controller.advance(&id, Stage::CodeGen, None).await.unwrap();
    controller
        .advance(&id, Stage::CodeGen, Some("add type hints"))
        .await
        .unwrap();
    for path in ["app/a.py", "app/b.py", "app/c.py"] {
        assert_eq!(file_versions(&controller, &id, path).len(), 2);
    }
    assert!(generator
        .calls()
        .iter()
        .filter(|c| c.stage == Stage::CodeGen)
        .skip(3)
        .all(|c| c.feedback.as_deref() == Some("add type hints")));
}

#[tokio::test]
async fn file_generation_respects_the_worker_bound() {
    let files = ["a.py", "b.py", "c.py", "d.py", "e.py", "f.py"];
    let generator =
        Arc::new(ScriptedGenerator::new("todo", &files).with_delay(Duration::from_millis(10)));
    let controller = setup_controller(generator.clone(), test_config().with_codegen_workers(2));
    let id = scaffolded(&controller).await;

    let aggregate = controller.advance(&id, Stage::CodeGen, None).await.unwrap();
    assert_eq!(aggregate.status, ArtifactStatus::Succeeded);
    assert!(generator.max_in_flight() <= 2);
    assert_eq!(generator.calls_for(Stage::CodeGen), files.len());
}

#[tokio::test]
async fn file_states_report_freshness() {
    let generator = Arc::new(ScriptedGenerator::default());
    let controller = setup_controller(generator.clone(), test_config());
    let id = scaffolded(&controller).await;

    let before = controller.code_gen_files(&id).unwrap();
    assert_eq!(before.len(), 3);
    assert!(before.iter().all(|s| !s.is_fresh()));

    controller.advance(&id, Stage::CodeGen, None).await.unwrap();
    assert!(controller
        .code_gen_files(&id)
        .unwrap()
        .iter()
        .all(|s| s.is_fresh()));
}

#[tokio::test]
async fn cached_retry_regenerates_an_invalid_file() {
    let generator = Arc::new(ScriptedGenerator::default());
    let controller = setup_controller(generator.clone(), cached_config());
    let id = scaffolded(&controller).await;

    generator.respond_file_once("app/b.py", "```python\n```");
    let first = controller.advance(&id, Stage::CodeGen, None).await.unwrap();
    assert_eq!(first.status, ArtifactStatus::PartiallyFailed);
    assert!(file_versions(&controller, &id, "app/b.py").is_empty());

    let second = controller.advance(&id, Stage::CodeGen, None).await.unwrap();
    assert_eq!(second.status, ArtifactStatus::Succeeded);
    let manifest = controller.code_gen_manifest(&id).unwrap().unwrap();
    let b = manifest.files.iter().find(|f| f.path == "app/b.py").unwrap();
    assert_eq!((b.outcome, b.version), (FileOutcome::Generated, Some(1)));
    assert_eq!(
        file_versions(&controller, &id, "app/b.py"),
        vec![(1, ArtifactStatus::Succeeded)]
    );
    assert_eq!(generator.file_calls("app/b.py"), 2);
    assert_eq!(generator.file_calls("app/a.py"), 1);
}

#[tokio::test]
async fn cancelled_code_gen_keeps_finished_files_but_writes_no_aggregate() {
    let generator = Arc::new(ScriptedGenerator::default());
    let controller = setup_controller(generator.clone(), test_config());
    let id = scaffolded(&controller).await;

    generator.hang_file("app/b.py");
    let cancel = CancellationToken::new();
    let (result, ()) = tokio::join!(
        controller.advance_with_cancel(&id, Stage::CodeGen, None, &cancel),
        async {
            tokio::time::sleep(Duration::from_millis(20)).await;
            cancel.cancel();
        }
    );
    assert!(matches!(
        result,
        Err(PipelineError::Cancelled {
            stage: Stage::CodeGen
        })
    ));

    let aggregate = ArtifactKey::stage(id.clone(), Stage::CodeGen);
    assert!(controller.store().history(&aggregate).unwrap().is_empty());
    assert!(file_versions(&controller, &id, "app/b.py").is_empty());
    for path in ["app/a.py", "app/c.py"] {
        assert_eq!(
            file_versions(&controller, &id, path),
            vec![(1, ArtifactStatus::Succeeded)]
        );
    }
}

#[tokio::test]
async fn tech_stack_change_regenerates_every_file() {
    let generator = Arc::new(ScriptedGenerator::default());
    let controller = setup_controller(generator.clone(), test_config());
    let id = scaffolded(&controller).await;
    controller.advance(&id, Stage::CodeGen, None).await.unwrap();

    let mut switched = requirements("todo", &ABC_FILES);
    switched.tech_stack = vec!["rust".to_string()];
    generator.respond(Stage::Scaffold, serde_json::to_string(&switched).unwrap());
    controller.advance(&id, Stage::Scaffold, None).await.unwrap();
    assert!(controller
        .code_gen_files(&id)
        .unwrap()
        .iter()
        .all(|s| !s.is_fresh()));

    let aggregate = controller.advance(&id, Stage::CodeGen, None).await.unwrap();
    assert_eq!(aggregate.status, ArtifactStatus::Succeeded);
    let manifest = controller.code_gen_manifest(&id).unwrap().unwrap();
    assert!(manifest
        .files
        .iter()
        .all(|f| f.outcome == FileOutcome::Generated && f.version == Some(2)));
    for path in ["app/a.py", "app/b.py", "app/c.py"] {
        assert_eq!(generator.file_calls(path), 2);
    }
}

#[tokio::test]
async fn feedback_after_partial_failure_refines_generated_files() {
    let generator = Arc::new(ScriptedGenerator::default());
    let controller = setup_controller(generator.clone(), test_config());
    let id = scaffolded(&controller).await;

    generator.fail_file("app/b.py", GenerationError::Permanent("refused".into()), 1);
    let first = controller.advance(&id, Stage::CodeGen, None).await.unwrap();
    assert_eq!(first.status, ArtifactStatus::PartiallyFailed);

    let second = controller
        .advance(&id, Stage::CodeGen, Some("add docstrings"))
        .await
        .unwrap();
    assert_eq!(second.status, ArtifactStatus::Succeeded);
    assert_eq!(second.version, 2);
    assert_eq!(
        file_versions(&controller, &id, "app/a.py"),
        vec![(1, ArtifactStatus::Succeeded), (2, ArtifactStatus::Succeeded)]
    );
    assert_eq!(
        file_versions(&controller, &id, "app/b.py"),
        vec![(1, ArtifactStatus::Failed), (2, ArtifactStatus::Succeeded)]
    );

    let refined: Vec<_> = generator
        .calls()
        .into_iter()
        .skip_while(|c| c.stage != Stage::CodeGen)
        .skip(3)
        .filter(|c| c.feedback.is_some())
        .filter_map(|c| c.file)
        .collect();
    assert_eq!(refined.len(), 2);
    assert!(!refined.contains(&"app/b.py".to_string()));
}

#[tokio::test]
async fn feedback_needs_a_generated_file() {
    let generator = Arc::new(ScriptedGenerator::default());
    let controller = setup_controller(generator.clone(), test_config());
    let id = scaffolded(&controller).await;

    for path in ["app/a.py", "app/b.py", "app/c.py"] {
        generator.fail_file(path, GenerationError::Permanent("refused".into()), 1);
    }
    controller.advance(&id, Stage::CodeGen, None).await.unwrap();
    let err = controller
        .advance(&id, Stage::CodeGen, Some("try harder"))
        .await
        .unwrap_err();
    assert!(matches!(err, PipelineError::InvalidRequest(_)));
}
