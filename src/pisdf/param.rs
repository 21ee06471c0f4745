// Copyright 2023 Google LLC
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//      http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use crate::expr::Expression;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ParamKind {
    /// Value fixed at graph construction.
    Static,
    /// Value produced at runtime by a config actor.
    Dynamic,
    /// Value derived from other parameters, re-evaluated per firing.
    DynamicDependant,
    /// Value taken from a parameter of the parent graph, per instance.
    Inherited,
}

/// A graph parameter. Names are case-folded; per-firing snapshots copy the
/// parameter list of the graph so that expression indices stay valid.
#[derive(Clone, Debug, PartialEq)]
pub struct Param {
    name: String,
    value: i64,
    kind: ParamKind,
    /// Index of the inherited parameter in the parent graph's list.
    parent: Option<usize>,
    /// Defining expression of a dynamic-dependant parameter.
    expression: Option<Expression>,
    /// Whether the value is currently known.
    set: bool,
}

impl Param {
    pub fn new_static(name: &str, value: i64) -> Self {
        Self {
            name: name.to_ascii_lowercase(),
            value,
            kind: ParamKind::Static,
            parent: None,
            expression: None,
            set: true,
        }
    }

    pub fn new_dynamic(name: &str) -> Self {
        Self {
            name: name.to_ascii_lowercase(),
            value: 0,
            kind: ParamKind::Dynamic,
            parent: None,
            expression: None,
            set: false,
        }
    }

    pub fn new_dynamic_dependant(name: &str, expression: Expression) -> Self {
        Self {
            name: name.to_ascii_lowercase(),
            value: 0,
            kind: ParamKind::DynamicDependant,
            parent: None,
            expression: Some(expression),
            set: false,
        }
    }

    pub fn new_inherited(name: &str, parent: usize) -> Self {
        Self {
            name: name.to_ascii_lowercase(),
            value: 0,
            kind: ParamKind::Inherited,
            parent: Some(parent),
            expression: None,
            set: false,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> ParamKind {
        self.kind
    }

    pub fn value(&self) -> i64 {
        self.value
    }

    /// True when the value may differ between firings or arrive at runtime.
    pub fn dynamic(&self) -> bool {
        self.kind != ParamKind::Static
    }

    /// Whether the value is currently known (static parameters always are).
    pub fn is_set(&self) -> bool {
        self.set
    }

    pub fn parent(&self) -> Option<usize> {
        self.parent
    }

    pub fn expression(&self) -> Option<&Expression> {
        self.expression.as_ref()
    }

    pub fn set_value(&mut self, value: i64) {
        self.value = value;
        self.set = true;
    }

    /// Forget a runtime-provided value between graph iterations.
    pub fn unset(&mut self) {
        if self.kind != ParamKind::Static {
            self.set = false;
        }
    }
}
