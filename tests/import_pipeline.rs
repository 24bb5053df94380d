use branch_dashboard_lib::models::{
    FieldValue, Grade, ImportOptions, IssueKind, SaveAdjustmentPayload, TransactionMode, UpdateAdjustmentPayload,
    Workbook,
};
use branch_dashboard_lib::{DashboardCore, SchemaRegistry};
use std::sync::Arc;

const DIMENSIONS: [&str; 7] = ["组织建设", "党员管理", "组织生活", "作风建设", "业务融合", "群众满意度", "创新特色"];

fn open(dir: &tempfile::TempDir) -> Arc<DashboardCore> {
    DashboardCore::new(&dir.path().join("dashboard.sqlite"), SchemaRegistry::builtin().expect("registry"))
        .expect("core")
}

fn workbook(value: serde_json::Value) -> Workbook {
    serde_json::from_value(value).expect("workbook")
}

fn dimension_rows(branch: &str, score: f64) -> Vec<serde_json::Value> {
    DIMENSIONS
        .iter()
        .map(|dimension| serde_json::json!([branch, dimension, score]))
        .collect()
}

fn full_workbook() -> Workbook {
    let mut dimension_sheet = vec![serde_json::json!(["支部名称", "评价维度", "得分"])];
    dimension_sheet.extend(dimension_rows("第一支部", 80.0));
    dimension_sheet.extend(dimension_rows("第二支部", 80.0));

    // Children listed before parents on purpose.
    workbook(serde_json::json!({
        "sheets": [
            { "name": "维度评分", "rows": dimension_sheet },
            {
                "name": "支部信息",
                "rows": [
                    ["支部编号", "支部名稱", "党员人数", "成立日期", "备注说明"],
                    ["B-001", "第一支部", 32, 44197, "首批"],
                    ["B-002", "第二支部", "28", "2019/7/1", ""]
                ]
            }
        ]
    }))
}

#[test]
fn imports_parents_before_children_and_scores_affected_branches() {
    let dir = tempfile::tempdir().expect("tempdir");
    let core = open(&dir);

    let result = core
        .import_workbook(&full_workbook(), ImportOptions::default())
        .expect("import");

    assert!(result.success, "errors: {:?}", result.errors);
    assert_eq!(result.inserted, 16);
    assert_eq!(result.sheets[0].table.as_deref(), Some("branches"));
    assert!(result
        .sheets[0]
        .columns
        .iter()
        .any(|column| column.header == "支部名稱" && column.field == "name" && !column.exact));
    assert!(result
        .warnings
        .iter()
        .any(|warning| warning.kind == IssueKind::FieldResolutionMiss && warning.column.as_deref() == Some("备注说明")));

    let branch = core.get_branch("B-001").expect("get").expect("branch");
    assert_eq!(branch.name, "第一支部");
    assert_eq!(branch.attributes.get("established_on"), Some(&serde_json::json!("2021-01-01")));
    assert_eq!(branch.attributes.get("member_count"), Some(&serde_json::json!(32.0)));

    let aggregate = core.get_aggregate("B-001").expect("aggregate").expect("stored");
    assert_eq!(aggregate.base_score, 80.0);
    assert_eq!(aggregate.base_grade, Grade::A);
    assert_eq!(aggregate.management_score, 0.0);
    assert_eq!(aggregate.total_score, 64.0);
    assert_eq!(aggregate.grade, Grade::B);
    assert_eq!(aggregate.radar.data.len(), 8);
    assert_eq!(aggregate.radar.data[7], 0.0);
}

#[test]
fn reimporting_the_same_keys_updates_instead_of_duplicating() {
    let dir = tempfile::tempdir().expect("tempdir");
    let core = open(&dir);
    core.import_workbook(&full_workbook(), ImportOptions::default())
        .expect("first import");

    let second = core
        .import_workbook(&full_workbook(), ImportOptions::default())
        .expect("second import");

    assert!(second.success);
    assert_eq!(second.inserted, 0);
    assert_eq!(second.updated, 16);
    assert_eq!(core.list_branches().expect("branches").len(), 2);
    assert_eq!(core.list_dimension_scores("B-001").expect("scores").len(), 7);

    let renamed_secretary = workbook(serde_json::json!({
        "sheets": [{
            "name": "支部信息",
            "rows": [["支部编号", "支部名称", "支部书记"], ["B-002", "第二支部", "李四"]]
        }]
    }));
    let third = core
        .import_workbook(&renamed_secretary, ImportOptions::default())
        .expect("third import");
    assert_eq!(third.updated, 1);
    let branch = core.get_branch("B-002").expect("get").expect("branch");
    assert_eq!(branch.attributes.get("secretary"), Some(&serde_json::json!("李四")));
}

#[test]
fn blank_branch_code_reimports_by_name() {
    let dir = tempfile::tempdir().expect("tempdir");
    let core = open(&dir);
    let sheet = workbook(serde_json::json!({
        "sheets": [{
            "name": "支部信息",
            "rows": [["支部编号", "支部名称", "党员人数"], ["", "第三支部", 10]]
        }]
    }));

    let first = core.import_workbook(&sheet, ImportOptions::default()).expect("first import");
    assert_eq!(first.inserted, 1);
    let code = core.list_branches().expect("branches")[0].code.clone();

    let second = core.import_workbook(&sheet, ImportOptions::default()).expect("second import");
    assert!(second.success, "errors: {:?}", second.errors);
    assert_eq!(second.inserted, 0);
    assert_eq!(second.updated, 1);

    let branches = core.list_branches().expect("branches");
    assert_eq!(branches.len(), 1);
    assert_eq!(branches[0].code, code);
}

#[test]
fn unknown_parent_names_are_never_fabricated() {
    let dir = tempfile::tempdir().expect("tempdir");
    let core = open(&dir);
    core.import_workbook(&full_workbook(), ImportOptions::default())
        .expect("seed");

    let result = core
        .import_workbook(
            &workbook(serde_json::json!({
                "sheets": [{
                    "name": "维度评分",
                    "rows": [["支部", "维度", "分数"], ["第一支部", "作风建设", 90], ["第三支部", "作风建设", 70]]
                }]
            })),
            ImportOptions::default(),
        )
        .expect("import");

    assert_eq!(result.updated, 1);
    assert_eq!(result.total_errors, 1);
    assert_eq!(result.errors[0].kind, IssueKind::EntityResolutionFailure);
    assert_eq!(result.errors[0].row_index, 2);
    assert_eq!(core.list_branches().expect("branches").len(), 2);
}

#[test]
fn all_or_nothing_rolls_back_every_sheet() {
    let dir = tempfile::tempdir().expect("tempdir");
    let core = open(&dir);

    let result = core
        .import_workbook(
            &workbook(serde_json::json!({
                "sheets": [
                    { "name": "支部信息", "rows": [["支部编号", "支部名称"], ["B-001", "第一支部"]] },
                    {
                        "name": "维度评分",
                        "rows": [["支部名称", "评价维度", "得分"], ["第一支部", "作风建设", 90], ["第一支部", "作风建设", 120]]
                    }
                ]
            })),
            ImportOptions {
                mode: Some(TransactionMode::AllOrNothing),
                strategy: None,
            },
        )
        .expect("import");

    assert!(!result.success);
    assert!(result.rolled_back);
    assert_eq!(result.inserted, 0);
    assert_eq!(result.updated, 0);
    assert_eq!(result.total_errors, 1);
    assert_eq!(result.errors[0].kind, IssueKind::ValidationFailure);
    assert_eq!(result.errors[0].sheet, "维度评分");
    assert!(core.list_branches().expect("branches").is_empty());
    assert!(core.ranking().expect("ranking").is_empty());

    let batches = core.list_import_batches(10).expect("batches");
    assert_eq!(batches.len(), 1);
    assert!(batches[0].rolled_back);
}

#[test]
fn adjustment_changes_recompute_the_aggregate() {
    let dir = tempfile::tempdir().expect("tempdir");
    let core = open(&dir);
    core.import_workbook(&full_workbook(), ImportOptions::default())
        .expect("seed");

    let adjustment = core
        .create_adjustment(SaveAdjustmentPayload {
            branch_code: "B-001".to_string(),
            adjustment_type: "荣誉加分".to_string(),
            score: 2.0,
            reason: Some("先进基层党组织".to_string()),
            evaluator: Some("党委".to_string()),
            adjusted_on: None,
            active: None,
        })
        .expect("create");
    assert_eq!(adjustment.adjustment_type, "honor");
    assert!(adjustment.active);

    let aggregate = core.get_aggregate("B-001").expect("aggregate").expect("stored");
    assert_eq!(aggregate.management_score, 2.0);
    assert_eq!(aggregate.total_score, 68.0);
    assert_eq!(aggregate.radar.data[7], 20.0);

    core.update_adjustment(
        &adjustment.id,
        UpdateAdjustmentPayload {
            active: Some(false),
            ..UpdateAdjustmentPayload::default()
        },
    )
    .expect("update");
    let aggregate = core.get_aggregate("B-001").expect("aggregate").expect("stored");
    assert_eq!(aggregate.management_score, 0.0);
    assert_eq!(aggregate.total_score, 64.0);

    let rejected = core.update_adjustment(
        &adjustment.id,
        UpdateAdjustmentPayload {
            score: Some(6.0),
            ..UpdateAdjustmentPayload::default()
        },
    );
    assert!(rejected.is_err());

    assert!(core.delete_adjustment(&adjustment.id).expect("delete"));
    assert!(!core.delete_adjustment(&adjustment.id).expect("second delete"));
    assert!(core.list_adjustments("B-001").expect("list").is_empty());
}

#[test]
fn imported_adjustments_feed_the_management_score() {
    let dir = tempfile::tempdir().expect("tempdir");
    let core = open(&dir);
    core.import_workbook(&full_workbook(), ImportOptions::default())
        .expect("seed");

    let result = core
        .import_workbook(
            &workbook(serde_json::json!({
                "sheets": [{
                    "name": "管理加减分",
                    "rows": [
                        ["支部名称", "评价类型", "分值", "评价日期", "是否有效"],
                        ["第二支部", "leadership_review", -1.5, "2024年3月1日", "是"],
                        ["第二支部", "honor", 9, "2024-03-02", "是"],
                        ["第二支部", "honor", 1, "20240303", "否"]
                    ]
                }]
            })),
            ImportOptions::default(),
        )
        .expect("import");

    assert_eq!(result.inserted, 2);
    assert_eq!(result.total_errors, 1);
    assert_eq!(result.errors[0].column.as_deref(), Some("score"));

    let adjustments = core.list_adjustments("B-002").expect("list");
    assert_eq!(adjustments.len(), 2);
    assert_eq!(
        adjustments[0].adjusted_on.map(|date| FieldValue::Date(date).to_string()),
        Some("2024-03-01".to_string())
    );

    let aggregate = core.get_aggregate("B-002").expect("aggregate").expect("stored");
    assert_eq!(aggregate.management_score, -1.5);
    assert_eq!(aggregate.total_score, 61.0);
    assert_eq!(aggregate.grade, Grade::B);
}

#[test]
fn ranking_orders_by_total_then_name() {
    let dir = tempfile::tempdir().expect("tempdir");
    let core = open(&dir);
    core.import_workbook(&full_workbook(), ImportOptions::default())
        .expect("seed");

    let ranking = core.ranking().expect("ranking");
    assert_eq!(ranking.len(), 2);
    assert_eq!(ranking[0].branch_name, "第一支部");

    core.create_adjustment(SaveAdjustmentPayload {
        branch_code: "B-002".to_string(),
        adjustment_type: "honor".to_string(),
        score: 1.0,
        reason: None,
        evaluator: None,
        adjusted_on: None,
        active: None,
    })
    .expect("create");

    let ranking = core.ranking().expect("ranking");
    assert_eq!(ranking[0].branch_code, "B-002");
    assert_eq!(ranking[0].total_score, 66.0);

    let grades = core.grade_distribution().expect("grades");
    let b = grades.iter().find(|entry| entry.grade == Grade::B).expect("B bucket");
    assert_eq!(b.count, 2);
}

#[test]
fn trend_follows_the_evaluation_period() {
    let dir = tempfile::tempdir().expect("tempdir");
    let core = open(&dir);
    core.update_settings(serde_json::json!({ "evaluationPeriod": "2023" }))
        .expect("settings");
    core.import_workbook(&full_workbook(), ImportOptions::default())
        .expect("seed");

    core.update_settings(serde_json::json!({ "evaluationPeriod": "2024" }))
        .expect("settings");
    let first = core.recompute("B-001").expect("recompute");
    let second = core.recompute("B-001").expect("recompute");

    assert_eq!(first, second);
    assert_eq!(first.trend.labels, vec!["2023", "2024"]);
    assert_eq!(first.trend.data, vec![64.0, 64.0]);

    core.update_settings(serde_json::json!({ "trendWindow": 1 }))
        .expect("settings");
    let narrowed = core.recompute("B-001").expect("recompute");
    assert_eq!(narrowed.trend.labels, vec!["2024"]);

    let all = core.recompute_all().expect("recompute all");
    assert_eq!(all.len(), 2);
}

#[test]
fn deleting_a_branch_removes_its_children_and_aggregate() {
    let dir = tempfile::tempdir().expect("tempdir");
    let core = open(&dir);
    core.import_workbook(&full_workbook(), ImportOptions::default())
        .expect("seed");
    core.import_workbook(
        &workbook(serde_json::json!({
            "sheets": [{
                "name": "人员分布",
                "rows": [["支部名称", "类别", "分组", "人数"], ["第一支部", "年龄", "35岁以下", 12]]
            }]
        })),
        ImportOptions::default(),
    )
    .expect("distributions");
    assert_eq!(core.list_distributions("B-001").expect("distributions").len(), 1);

    assert!(core.delete_branch("B-001").expect("delete"));

    assert!(core.get_branch("B-001").expect("get").is_none());
    assert!(core.list_dimension_scores("B-001").expect("scores").is_empty());
    assert!(core.list_distributions("B-001").expect("distributions").is_empty());
    assert!(core.get_aggregate("B-001").expect("aggregate").is_none());
    assert_eq!(core.ranking().expect("ranking").len(), 1);
    assert!(core.recompute("B-001").is_err());
}

#[test]
fn registry_with_unbalanced_weights_is_rejected() {
    let yaml = include_str!("../src/schema/registry.yaml").replace("weight: 0.20", "weight: 0.25");
    let error = SchemaRegistry::from_yaml(&yaml).expect_err("weights sum to 1.05");
    assert!(error.to_string().starts_with("CONFIG_INVALID"));
}
