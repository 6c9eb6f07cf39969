// crates/live-core/tests/params_uploads.rs
use live_core::{validate_uploads, Params, UploadConfig, UploadError};
use serde_json::json;

fn params(value: serde_json::Value) -> Params {
    serde_json::from_value(value).expect("params object")
}

#[test]
fn query_string_repeated_keys_become_arrays() {
    let p = Params::from_query("?page=2&tag=a&tag=b&ok=on&q=hello+world");
    assert_eq!(p.int("page"), 2);
    assert_eq!(p.get("tag"), Some(&json!(["a", "b"])));
    assert!(p.checkbox("ok"));
    assert_eq!(p.string("q"), "hello world");
    assert_eq!(p.to_query(), "ok=on&page=2&q=hello+world&tag=a&tag=b");
}

#[test]
fn typed_accessors_are_lenient() {
    let p = params(json!({
        "n": 7,
        "s": " 12 ",
        "f": "1.5",
        "g": 2.25,
        "bad": "x",
        "flag": true
    }));
    assert_eq!(p.int("n"), 7);
    assert_eq!(p.int("s"), 12);
    assert_eq!(p.int("bad"), 0);
    assert_eq!(p.int("missing"), 0);
    assert_eq!(p.float32("f"), 1.5);
    assert_eq!(p.float32("g"), 2.25);
    assert_eq!(p.string("n"), "7");
    assert_eq!(p.string("missing"), "");
    assert!(p.checkbox("flag"));
    assert!(!p.checkbox("s"));
}

#[test]
fn no_uploads_param_means_no_uploads() {
    let configs = [UploadConfig::new("photos")];
    let ctx = validate_uploads(&configs, &Params::new());
    assert!(ctx.is_empty());
    assert!(!ctx.has_errors());
}

#[test]
fn missing_field_is_not_found() {
    let configs = [UploadConfig::new("photos")];
    let ctx = validate_uploads(&configs, &params(json!({ "uploads": {} })));
    let photos = ctx.get("photos");
    assert_eq!(photos.len(), 1);
    assert_eq!(photos[0].errors, vec![UploadError::NotFound]);
    assert!(ctx.has_errors());
}

#[test]
fn too_many_files_is_one_error() {
    let configs = [UploadConfig::new("photos").max_files(1)];
    let ctx = validate_uploads(
        &configs,
        &params(json!({ "uploads": { "photos": [
            { "name": "a.png", "size": 1, "type": "image/png" },
            { "name": "b.png", "size": 1, "type": "image/png" }
        ]}})),
    );
    assert_eq!(
        ctx.get("photos")[0].errors,
        vec![UploadError::TooManyFiles { count: 2, max: 1 }]
    );
}

#[test]
fn each_violated_rule_is_recorded() {
    let configs = [UploadConfig::new("photos")
        .max_files(3)
        .max_size(100)
        .accept(["image/png"])];
    let ctx = validate_uploads(
        &configs,
        &params(json!({ "uploads": { "photos": [
            { "name": "ok.png", "size": 50, "type": "image/png", "progress": 0.5 },
            { "name": "big.gif", "size": 500, "type": "image/gif" }
        ]}})),
    );
    let photos = ctx.get("photos");
    assert_eq!(photos.len(), 2);
    assert!(photos[0].is_valid());
    assert_eq!(photos[0].name, "ok.png");
    assert_eq!(photos[0].progress, 0.5);
    assert_eq!(
        photos[1].errors,
        vec![
            UploadError::TooLarge { size: 500, max: 100 },
            UploadError::NotAccepted {
                content_type: "image/gif".to_string()
            },
        ]
    );
}

#[test]
fn non_list_field_is_malformed() {
    let configs = [UploadConfig::new("doc")];
    let ctx = validate_uploads(&configs, &params(json!({ "uploads": { "doc": "nope" } })));
    assert_eq!(ctx.get("doc")[0].errors, vec![UploadError::Malformed]);
}
