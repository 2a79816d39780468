// Copyright 2025 jonefeewang@gmail.com
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Per-field filtering of field group payloads.
//!
//! A `FieldFilter` combines a predicate ("description filter"), which accepts
//! or rejects a whole message, and a projection ("eliminate filter"), which
//! keeps only the required fields in the required order.

use bytes::Bytes;
use tracing::trace;

use crate::AppResult;

pub use description::FilterExpr;
pub use field_group::{decode_fields, encode_field_group, FieldGroupWriter};

mod description;
mod field_group;

#[derive(Debug, Clone, Default)]
pub struct FieldFilter {
    required_field_names: Vec<String>,
    predicate: Option<FilterExpr>,
}

impl FieldFilter {
    pub fn new(required_field_names: &[String], filter_desc: &str) -> AppResult<Self> {
        let mut filter = FieldFilter::default();
        filter.init(required_field_names, filter_desc)?;
        Ok(filter)
    }

    pub fn init(&mut self, required_field_names: &[String], filter_desc: &str) -> AppResult<()> {
        self.predicate = if filter_desc.trim().is_empty() {
            None
        } else {
            Some(FilterExpr::parse(filter_desc)?)
        };
        self.required_field_names = required_field_names.to_vec();
        Ok(())
    }

    pub fn is_configured(&self) -> bool {
        self.predicate.is_some() || !self.required_field_names.is_empty()
    }

    /// `None` rejects the message. Otherwise returns the projected payload,
    /// or `data` itself when there is nothing to project.
    pub fn filter(&self, data: &Bytes) -> Option<Bytes> {
        match self.apply(data) {
            FieldVerdict::Rejected => None,
            FieldVerdict::Unchanged => Some(data.clone()),
            FieldVerdict::Projected(projected) => Some(projected),
        }
    }

    pub fn apply(&self, data: &[u8]) -> FieldVerdict {
        if !self.is_configured() {
            return FieldVerdict::Unchanged;
        }
        field_group::with_local_scratch(|scratch| {
            if let Err(e) = decode_fields(data, &mut scratch.fields) {
                trace!("payload is no field group: {}", e);
                return match self.predicate {
                    Some(_) => FieldVerdict::Rejected,
                    None => FieldVerdict::Unchanged,
                };
            }
            let fields = &scratch.fields;
            let lookup = |name: &str| {
                fields
                    .iter()
                    .find(|(field, _)| &data[field.clone()] == name.as_bytes())
                    .map(|(_, value)| &data[value.clone()])
            };

            if let Some(predicate) = &self.predicate {
                if !predicate.evaluate(&lookup) {
                    return FieldVerdict::Rejected;
                }
            }
            if self.required_field_names.is_empty() {
                return FieldVerdict::Unchanged;
            }

            let writer = &mut scratch.writer;
            writer.reset();
            for name in &self.required_field_names {
                if let Some(value) = lookup(name) {
                    writer.add_field(name.as_bytes(), value);
                }
            }
            if writer.is_empty() {
                FieldVerdict::Unchanged
            } else {
                FieldVerdict::Projected(writer.finish())
            }
        })
    }
}

/// What a `FieldFilter` decided for one payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FieldVerdict {
    Rejected,
    /// accepted, the payload stays as it is
    Unchanged,
    Projected(Bytes),
}
