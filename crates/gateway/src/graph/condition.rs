use crate::{Error, Result};
use proto_gateway::data::{attr_value, Doc};

/// A filter predicate over documents entering a deployment, compiled from
/// a JSON representation at topology build time:
///
/// ```json
/// {"$or": [{"lang": "en"}, {"score": {"$gte": 0.5}}]}
/// ```
///
/// An object with several fields is an implicit `$and`. A bare scalar value
/// is shorthand for `$eq`.
#[derive(Clone, Debug)]
pub enum Condition {
    And(Vec<Condition>),
    Or(Vec<Condition>),
    Not(Box<Condition>),
    Compare {
        field: String,
        op: Op,
        value: serde_json::Value,
    },
    Exists {
        field: String,
        expected: bool,
    },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Op {
    Eq,
    Ne,
    Gt,
    Gte,
    Lt,
    Lte,
    In,
}

// A document field referenced by a condition: the well-known `id` / `text`
// fields, or an entry of the attribute map.
enum Field<'a> {
    Text(&'a str),
    Number(f64),
    Flag(bool),
    Missing,
}

impl Condition {
    pub fn parse(value: &serde_json::Value) -> Result<Self> {
        let Some(object) = value.as_object() else {
            return Err(Error::Condition(format!(
                "condition must be a JSON object, got: {value}"
            )));
        };

        let mut clauses = Vec::with_capacity(object.len());
        for (key, value) in object {
            clauses.push(match key.as_str() {
                "$and" => Condition::And(Self::parse_list(value)?),
                "$or" => Condition::Or(Self::parse_list(value)?),
                "$not" => Condition::Not(Box::new(Self::parse(value)?)),
                field => Self::parse_field(field, value)?,
            });
        }
        match clauses.len() {
            0 => Err(Error::Condition("condition object is empty".to_string())),
            1 => Ok(clauses.pop().unwrap()),
            _ => Ok(Condition::And(clauses)),
        }
    }

    fn parse_list(value: &serde_json::Value) -> Result<Vec<Self>> {
        let Some(items) = value.as_array() else {
            return Err(Error::Condition(format!(
                "$and / $or expect an array of conditions, got: {value}"
            )));
        };
        items.iter().map(Self::parse).collect()
    }

    fn parse_field(field: &str, value: &serde_json::Value) -> Result<Self> {
        let Some(ops) = value.as_object() else {
            // Scalar shorthand for equality.
            return Ok(Condition::Compare {
                field: field.to_string(),
                op: Op::Eq,
                value: value.clone(),
            });
        };

        let mut clauses = Vec::with_capacity(ops.len());
        for (op, operand) in ops {
            let op = match op.as_str() {
                "$eq" => Op::Eq,
                "$ne" => Op::Ne,
                "$gt" => Op::Gt,
                "$gte" => Op::Gte,
                "$lt" => Op::Lt,
                "$lte" => Op::Lte,
                "$in" => {
                    if !operand.is_array() {
                        return Err(Error::Condition(format!(
                            "$in expects an array, got: {operand}"
                        )));
                    }
                    Op::In
                }
                "$exists" => {
                    let Some(expected) = operand.as_bool() else {
                        return Err(Error::Condition(format!(
                            "$exists expects a boolean, got: {operand}"
                        )));
                    };
                    clauses.push(Condition::Exists {
                        field: field.to_string(),
                        expected,
                    });
                    continue;
                }
                other => {
                    return Err(Error::Condition(format!("unknown operator '{other}'")));
                }
            };
            clauses.push(Condition::Compare {
                field: field.to_string(),
                op,
                value: operand.clone(),
            });
        }
        match clauses.len() {
            0 => Err(Error::Condition(format!("no operators for field '{field}'"))),
            1 => Ok(clauses.pop().unwrap()),
            _ => Ok(Condition::And(clauses)),
        }
    }

    /// Evaluate this condition against `doc`.
    ///
    /// Evaluation is pure. Ordering comparisons against a non-numeric
    /// document field are an error, which fails the whole request.
    pub fn matches(&self, doc: &Doc) -> Result<bool> {
        match self {
            Condition::And(clauses) => {
                for clause in clauses {
                    if !clause.matches(doc)? {
                        return Ok(false);
                    }
                }
                Ok(true)
            }
            Condition::Or(clauses) => {
                for clause in clauses {
                    if clause.matches(doc)? {
                        return Ok(true);
                    }
                }
                Ok(false)
            }
            Condition::Not(clause) => Ok(!clause.matches(doc)?),
            Condition::Compare { field, op, value } => {
                compare(&lookup(doc, field), *op, value, field)
            }
            Condition::Exists { field, expected } => {
                let exists = !matches!(lookup(doc, field), Field::Missing);
                Ok(exists == *expected)
            }
        }
    }
}

fn lookup<'a>(doc: &'a Doc, field: &str) -> Field<'a> {
    match field {
        "id" => Field::Text(&doc.id),
        "text" if !doc.text.is_empty() => Field::Text(&doc.text),
        "text" => Field::Missing,
        _ => match doc.attributes.get(field).and_then(|v| v.kind.as_ref()) {
            Some(attr_value::Kind::Text(s)) => Field::Text(s),
            Some(attr_value::Kind::Number(n)) => Field::Number(*n),
            Some(attr_value::Kind::Flag(b)) => Field::Flag(*b),
            Some(attr_value::Kind::Json(_)) | None => Field::Missing,
        },
    }
}

fn compare(field: &Field<'_>, op: Op, value: &serde_json::Value, name: &str) -> Result<bool> {
    match op {
        Op::Eq => Ok(equals(field, value)),
        Op::Ne => Ok(!equals(field, value)),
        Op::In => Ok(value
            .as_array()
            .map(|items| items.iter().any(|item| equals(field, item)))
            .unwrap_or(false)),
        Op::Gt | Op::Gte | Op::Lt | Op::Lte => {
            let Some(rhs) = value.as_f64() else {
                return Err(Error::Condition(format!(
                    "cannot order-compare '{name}' against non-numeric operand {value}"
                )));
            };
            let lhs = match field {
                Field::Number(n) => *n,
                Field::Missing => return Ok(false),
                _ => {
                    return Err(Error::Condition(format!(
                        "cannot order-compare non-numeric field '{name}'"
                    )));
                }
            };
            Ok(match op {
                Op::Gt => lhs > rhs,
                Op::Gte => lhs >= rhs,
                Op::Lt => lhs < rhs,
                Op::Lte => lhs <= rhs,
                _ => unreachable!(),
            })
        }
    }
}

fn equals(field: &Field<'_>, value: &serde_json::Value) -> bool {
    match (field, value) {
        (Field::Text(s), serde_json::Value::String(v)) => *s == v.as_str(),
        (Field::Number(n), serde_json::Value::Number(_)) => value.as_f64() == Some(*n),
        (Field::Flag(b), serde_json::Value::Bool(v)) => b == v,
        _ => false,
    }
}
