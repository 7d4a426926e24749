//! The built-in snippet set.
//!
//! Order matters only for the layout of the generated file.

use super::{ContArg, Fragment, PinWidth, SnippetDef};
use crate::core::CodeModel;

use Fragment::{Const, Continue, Text};

static REGISTRY: &[SnippetDef] = &[
    SnippetDef::new(
        "store_local_i32",
        &[
            Text("{ uint32_t k0; asm (\"movl $"),
            Const(0),
            Text(", %%eax\": \"=a\"(k0)); *(int*)($stack + k0) = x;"),
            Continue { index: 0, args: &[] },
            Text("}"),
        ],
    )
    .params(&["int x"])
    .consts(1)
    .continuations(1)
    .pin(0, PinWidth::Bits32),
    SnippetDef::new(
        "const_i32",
        &[
            Text("{ int k0; asm (\"movl $"),
            Const(0),
            Text(", %%eax\": \"=a\"(k0));"),
            Continue {
                index: 0,
                args: &[ContArg::int("k0")],
            },
            Text("}"),
        ],
    )
    .consts(1)
    .continuations(1)
    .pin(0, PinWidth::Bits32),
    SnippetDef::new(
        "load_local_i32",
        &[
            Text("{ int x = *(int*)($stack + "),
            Const(0),
            Text(");"),
            Continue {
                index: 0,
                args: &[ContArg::int("x")],
            },
            Text("}"),
        ],
    )
    .consts(1)
    .continuations(1),
    SnippetDef::new(
        "add",
        &[
            Text("{ int v = a + b;"),
            Continue {
                index: 0,
                args: &[ContArg::int("v")],
            },
            Text("}"),
        ],
    )
    .params(&["int a", "int b"])
    .continuations(1)
    .variants(8),
    SnippetDef::new(
        "mul",
        &[
            Text("{ int v = a * b;"),
            Continue {
                index: 0,
                args: &[ContArg::int("v")],
            },
            Text("}"),
        ],
    )
    .params(&["int a", "int b"])
    .continuations(1)
    .variants(8),
    SnippetDef::new(
        "assign_indirect",
        &[
            Text("{ *(int*)(offset) = v;"),
            Continue { index: 0, args: &[] },
            Text("}"),
        ],
    )
    .params(&["uintptr_t offset", "int v"])
    .continuations(1)
    .variants(8),
    SnippetDef::new(
        "if_then_else",
        &[
            Text("{ if (cond) {"),
            Continue { index: 0, args: &[] },
            Text("} else {"),
            Continue { index: 1, args: &[] },
            Text("}"),
            Text("}"),
        ],
    )
    .params(&["bool cond"])
    .continuations(2),
    // 'exit' may live far away from generated code.
    SnippetDef::new("sysexit", &[Text("{ exit(rc); }")])
        .params(&["int rc"])
        .externs(&["exit"])
        .model(CodeModel::Large),
    SnippetDef::new(
        "func_entry",
        &[
            Text("{ asm(\"sub $32, %rsp\");"),
            Continue { index: 0, args: &[] },
            Text("}"),
        ],
    )
    .continuations(1),
    SnippetDef::new(
        "return",
        &[Text("{ asm(\"add $32, %rsp\"); "), Text("  return rc; }")],
    )
    .params(&["int rc"])
    .returns("int"),
    SnippetDef::new("return_void", &[Text("{ asm(\"add $32, %rsp\"); "), Text("  return; }")]),
];

/// The built-in snippets, in emission order.
pub fn builtin() -> &'static [SnippetDef] {
    REGISTRY
}

/// Look up a built-in snippet by name.
pub fn find(name: &str) -> Option<&'static SnippetDef> {
    REGISTRY.iter().find(|def| def.name == name)
}
