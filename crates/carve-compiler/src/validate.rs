//! Semantic validation ahead of lowering.
//!
//! Checks declaration order, duplicate names, enum underlying types, and
//! type recursion. Runs after parsing so it sees the whole program; errors
//! carry `E####` codes.

use std::collections::{HashMap, HashSet};

use carve_core::TypeId;

use crate::ast::*;
use crate::diagnostics::{Diagnostic, Diagnostics};

/// Validate a program. `max_type_depth` bounds nested type expansion;
/// 0 means unlimited.
pub fn validate(program: &Program, max_type_depth: u64) -> Diagnostics {
    let mut validator = Validator {
        diagnostics: Diagnostics::new(),
        declared: HashMap::new(),
    };
    validator.run(program, max_type_depth);
    validator.diagnostics
}

struct Validator<'a> {
    diagnostics: Diagnostics,
    /// Type name → declaration, in declaration order semantics.
    declared: HashMap<&'a str, &'a TypeDecl>,
}

impl<'a> Validator<'a> {
    fn run(&mut self, program: &'a Program, max_type_depth: u64) {
        for stmt in &program.statements {
            match stmt {
                Stmt::TypeDecl(decl) => self.check_type_decl(decl),
                Stmt::VarDecl(decl) => self.check_type_reference(&decl.type_name, decl),
            }
        }

        self.check_recursion(program, max_type_depth);
    }

    fn check_type_decl(&mut self, decl: &'a TypeDecl) {
        if self.declared.contains_key(decl.name.as_str()) {
            self.diagnostics.push(Diagnostic::error(
                "E0001",
                decl.span.clone(),
                format!("type `{}` is declared twice", decl.name),
            ));
        }

        match &decl.kind {
            TypeDef::Struct(def) | TypeDef::Union(def) => {
                for base in &def.inherits {
                    if !self.is_known_complex(base) {
                        self.diagnostics.push(Diagnostic::error(
                            "E0002",
                            decl.span.clone(),
                            format!("unknown base type `{base}`"),
                        ));
                    }
                }
                self.check_members(&def.members);
            }
            TypeDef::Enum(def) => {
                let underlying = TypeId::from_keyword(&def.underlying);
                if !underlying.is_some_and(|id| id.is_integer()) {
                    self.diagnostics.push(Diagnostic::error(
                        "E0003",
                        decl.span.clone(),
                        format!(
                            "enum underlying type `{}` is not a builtin integer",
                            def.underlying
                        ),
                    ));
                }
                let mut seen = HashSet::new();
                for constant in &def.constants {
                    if !seen.insert(constant.name.as_str()) {
                        self.diagnostics.push(Diagnostic::error(
                            "E0004",
                            constant.span.clone(),
                            format!("duplicate enum constant `{}`", constant.name),
                        ));
                    }
                }
            }
            TypeDef::Bitfield(def) => {
                let mut seen = HashSet::new();
                for field in &def.fields {
                    if !seen.insert(field.name.as_str()) {
                        self.diagnostics.push(Diagnostic::error(
                            "E0004",
                            field.span.clone(),
                            format!("duplicate bitfield field `{}`", field.name),
                        ));
                    }
                }
            }
        }

        self.declared.insert(&decl.name, decl);
    }

    /// Duplicate-name and type-reference checks over one member level.
    /// Branches of the same `if`/`match` may redeclare a name; siblings at
    /// one level may not.
    fn check_members(&mut self, members: &'a [Member]) {
        let mut seen = HashSet::new();
        for member in members {
            match member {
                Member::Decl(decl) => {
                    if !seen.insert(decl.name.as_str()) {
                        self.diagnostics.push(Diagnostic::error(
                            "E0004",
                            decl.span.clone(),
                            format!("duplicate member `{}`", decl.name),
                        ));
                    }
                    self.check_type_reference(&decl.type_name, decl);
                }
                Member::If {
                    then_body,
                    else_body,
                    ..
                } => {
                    self.check_members(then_body);
                    self.check_members(else_body);
                }
                Member::Match { arms, .. } => {
                    for arm in arms {
                        self.check_members(&arm.body);
                    }
                }
            }
        }
    }

    fn check_type_reference(&mut self, name: &str, decl: &VarDecl) {
        if TypeId::from_keyword(name).is_some() {
            return;
        }
        if !self.declared.contains_key(name) {
            self.diagnostics.push(
                Diagnostic::error(
                    "E0002",
                    decl.span.clone(),
                    format!("unknown type `{name}`"),
                )
                .with_hint("types must be declared before use"),
            );
        }
    }

    fn is_known_complex(&self, name: &str) -> bool {
        self.declared.contains_key(name)
    }

    /// Depth-first expansion of the type graph; cycles and over-deep
    /// nesting both surface as errors.
    fn check_recursion(&mut self, program: &'a Program, max_type_depth: u64) {
        let types: HashMap<&str, &TypeDecl> = program
            .statements
            .iter()
            .filter_map(|stmt| match stmt {
                Stmt::TypeDecl(decl) => Some((decl.name.as_str(), decl)),
                _ => None,
            })
            .collect();

        for decl in types.values() {
            let mut path = Vec::new();
            if let Some(depth) = self.expansion_depth(decl, &types, &mut path) {
                if max_type_depth != 0 && depth > max_type_depth {
                    self.diagnostics.push(Diagnostic::error(
                        "E0006",
                        decl.span.clone(),
                        format!(
                            "type `{}` nests {depth} levels deep, limit is {max_type_depth}",
                            decl.name
                        ),
                    ));
                }
            }
        }
    }

    /// `None` when a cycle was found (already reported).
    fn expansion_depth(
        &mut self,
        decl: &'a TypeDecl,
        types: &HashMap<&'a str, &'a TypeDecl>,
        path: &mut Vec<&'a str>,
    ) -> Option<u64> {
        if path.contains(&decl.name.as_str()) {
            self.diagnostics.push(Diagnostic::error(
                "E0005",
                decl.span.clone(),
                format!("type `{}` contains itself", decl.name),
            ));
            return None;
        }

        let (members, inherits) = match &decl.kind {
            TypeDef::Struct(def) | TypeDef::Union(def) => (&def.members[..], &def.inherits[..]),
            _ => return Some(1),
        };

        path.push(&decl.name);
        let mut deepest = 0;
        let mut refs: Vec<&str> = inherits.iter().map(String::as_str).collect();
        collect_member_types(members, &mut refs);

        for name in refs {
            if let Some(child) = types.get(name) {
                match self.expansion_depth(child, types, path) {
                    Some(depth) => deepest = deepest.max(depth),
                    None => {
                        path.pop();
                        return None;
                    }
                }
            }
        }
        path.pop();
        Some(deepest + 1)
    }
}

fn collect_member_types<'a>(members: &'a [Member], out: &mut Vec<&'a str>) {
    for member in members {
        match member {
            Member::Decl(decl) => {
                if TypeId::from_keyword(&decl.type_name).is_none() {
                    out.push(&decl.type_name);
                }
            }
            Member::If {
                then_body,
                else_body,
                ..
            } => {
                collect_member_types(then_body, out);
                collect_member_types(else_body, out);
            }
            Member::Match { arms, .. } => {
                for arm in arms {
                    collect_member_types(&arm.body, out);
                }
            }
        }
    }
}
