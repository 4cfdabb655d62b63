//! Python harness wrapped around user code before dispatch.
//!
//! The harness tees `print` into an ordered output list, resolves dataset
//! paths across the workspace and the read-only store, turns uncaught
//! exceptions into error-typed outputs, and always serializes the output
//! list as JSON to the agreed file. It is a versioned artifact with its
//! own tests, independent of the orchestration logic.

pub const HARNESS_VERSION: u32 = 1;

const USER_CODE_SLOT: &str = "@@USER_CODE@@";
const OUTPUT_PATH_SLOT: &str = "@@OUTPUT_PATH@@";

const TEMPLATE: &str = r#"import builtins as _pc_builtins
import json as _pc_json
import os as _pc_os
import traceback as _pc_traceback

_pc_outputs = []
_pc_print = _pc_builtins.print


def print(*args, sep=" ", end="\n", file=None, flush=False):
    text = sep.join(str(arg) for arg in args) + end
    _pc_outputs.append({"type": "text", "content": text})
    _pc_print(*args, sep=sep, end=end, file=file, flush=flush)


_PC_DATA_DIRS = ["/workspace", "/workspace/datasets", "/data"]


def dataset_path(name):
    for base in _PC_DATA_DIRS:
        path = _pc_os.path.join(base, name)
        if _pc_os.path.exists(path):
            return path
    # copies stored under uuid-suffixed alias names
    stem, ext = _pc_os.path.splitext(name)
    for base in _PC_DATA_DIRS:
        if not _pc_os.path.isdir(base):
            continue
        for entry in sorted(_pc_os.listdir(base)):
            if entry.startswith(stem + "_") and entry.endswith(ext):
                return _pc_os.path.join(base, entry)
    for base in _PC_DATA_DIRS:
        for root, _dirs, files in _pc_os.walk(base):
            if name in files:
                return _pc_os.path.join(root, name)
    return name


def show(value):
    columns = getattr(value, "columns", None)
    to_dict = getattr(value, "to_dict", None)
    if columns is not None and callable(to_dict):
        _pc_outputs.append({
            "type": "table",
            "content": str(value),
            "data": {
                "columns": [str(column) for column in columns],
                "rows": to_dict(orient="records"),
            },
        })
    else:
        _pc_outputs.append({"type": "text", "content": repr(value) + "\n"})


try:
@@USER_CODE@@
except BaseException:
    _pc_outputs.append({"type": "error", "content": _pc_traceback.format_exc()})
finally:
    with open(@@OUTPUT_PATH@@, "w") as _pc_file:
        _pc_json.dump(_pc_outputs, _pc_file)
"#;

/// Render the harness around raw user code.
///
/// `guest_output_path` is the in-sandbox path the output list is written
/// to. User code is inserted verbatim (indented into the try block), so
/// quoting and escaping inside it are untouched.
pub fn render(code: &str, guest_output_path: &str) -> String {
    let normalized = code.replace("\r\n", "\n");
    let body = if normalized.trim().is_empty() {
        "    pass".to_string()
    } else {
        normalized
            .lines()
            .map(|line| {
                if line.is_empty() {
                    String::new()
                } else {
                    format!("    {line}")
                }
            })
            .collect::<Vec<_>>()
            .join("\n")
    };

    // A JSON string literal is also a valid Python string literal here.
    let quoted_path = serde_json::to_string(guest_output_path)
        .unwrap_or_else(|_| format!("\"{guest_output_path}\""));

    TEMPLATE
        .replace(USER_CODE_SLOT, &body)
        .replace(OUTPUT_PATH_SLOT, &quoted_path)
}
