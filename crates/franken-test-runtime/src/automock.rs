//! Structural mock synthesis.
//!
//! Walks a real exports value and builds a mirror on the same heap:
//! functions become trackable stand-ins, arrays become empty arrays,
//! primitives are copied and objects are mirrored slot by slot. Every real
//! object maps to exactly one mock object, so shared and cyclic references
//! keep their shape.

use std::collections::{BTreeMap, BTreeSet};

use crate::value::{Heap, HeapResult, JsValue, ObjectHandle, ObjectKind};

/// Prototype chain depth considered when collecting slots.
const MAX_SLOT_DEPTH: usize = 32;

/// Outcome counters, surfaced in loader events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SynthesisStats {
    pub functions: usize,
    pub objects: usize,
    pub classes: usize,
}

pub fn synthesize(heap: &mut Heap, real: &JsValue) -> HeapResult<JsValue> {
    synthesize_with_stats(heap, real).map(|(value, _)| value)
}

pub fn synthesize_with_stats(
    heap: &mut Heap,
    real: &JsValue,
) -> HeapResult<(JsValue, SynthesisStats)> {
    let mut synthesizer = Synthesizer {
        heap,
        refs: BTreeMap::new(),
        stats: SynthesisStats::default(),
    };
    let value = synthesizer.mock_value(real)?;
    Ok((value, synthesizer.stats))
}

/// Synthesize into an object allocated beforehand, so references handed
/// out before synthesis see the finished mock. A primitive `real` is
/// returned as is and `target` is left untouched.
pub fn synthesize_into(
    heap: &mut Heap,
    real: &JsValue,
    target: ObjectHandle,
) -> HeapResult<(JsValue, SynthesisStats)> {
    let mut synthesizer = Synthesizer {
        heap,
        refs: BTreeMap::new(),
        stats: SynthesisStats::default(),
    };
    let value = match real {
        JsValue::Object(handle) => {
            synthesizer.mirror(*handle, target)?;
            JsValue::Object(target)
        }
        other => other.clone(),
    };
    Ok((value, synthesizer.stats))
}

struct Synthesizer<'h> {
    heap: &'h mut Heap,
    refs: BTreeMap<ObjectHandle, JsValue>,
    stats: SynthesisStats,
}

enum Shape {
    Function(String),
    Array,
    Object,
}

impl Synthesizer<'_> {
    fn mock_value(&mut self, value: &JsValue) -> HeapResult<JsValue> {
        let JsValue::Object(handle) = value else {
            return Ok(value.clone());
        };
        if let Some(existing) = self.refs.get(handle) {
            return Ok(existing.clone());
        }
        let mock = self.heap.alloc_plain();
        self.mirror(*handle, mock)?;
        Ok(JsValue::Object(mock))
    }

    /// Reshape the plain object `mock` into the mirror of `real`.
    fn mirror(&mut self, real: ObjectHandle, mock: ObjectHandle) -> HeapResult<()> {
        let shape = match &self.heap.get(real)?.kind {
            ObjectKind::Function { name, .. } => Shape::Function(name.clone()),
            ObjectKind::Array(_) => Shape::Array,
            ObjectKind::Plain | ObjectKind::Error { .. } => Shape::Object,
        };
        self.refs.insert(real, JsValue::Object(mock));
        match shape {
            Shape::Array => {
                self.heap.get_mut(mock)?.kind = ObjectKind::Array(Vec::new());
                Ok(())
            }
            Shape::Object => {
                self.stats.objects += 1;
                self.copy_slots(real, mock, &["constructor"])
            }
            Shape::Function(name) => {
                self.heap.convert_to_mock_function(mock, name)?;
                self.stats.functions += 1;
                self.copy_slots(real, mock, &["prototype", "name"])?;
                self.mock_prototype(real, mock)
            }
        }
    }

    /// Class-like functions (a `prototype` with members besides
    /// `constructor`) get a mocked prototype so instances built with `new`
    /// expose the same member names.
    fn mock_prototype(&mut self, real: ObjectHandle, mock: ObjectHandle) -> HeapResult<()> {
        let proto = self
            .heap
            .get(real)?
            .properties
            .get("prototype")
            .and_then(JsValue::as_object);
        let Some(proto) = proto else {
            return Ok(());
        };
        let members = self.slots(proto)?;
        if members.iter().all(|(key, _)| key == "constructor") {
            return Ok(());
        }
        let mock_proto = self.heap.alloc_plain();
        self.refs.insert(proto, JsValue::Object(mock_proto));
        self.stats.classes += 1;
        for (key, value) in members {
            if key == "constructor" {
                continue;
            }
            let mocked = self.mock_value(&value)?;
            self.heap.set_property(mock_proto, key, mocked)?;
        }
        self.heap
            .set_property(mock_proto, "constructor", JsValue::Object(mock))?;
        self.heap
            .set_property(mock, "prototype", JsValue::Object(mock_proto))
    }

    fn copy_slots(
        &mut self,
        real: ObjectHandle,
        mock: ObjectHandle,
        skip: &[&str],
    ) -> HeapResult<()> {
        for (key, value) in self.slots(real)? {
            if skip.contains(&key.as_str()) || self.heap.get(mock)?.properties.contains_key(&key) {
                continue;
            }
            let mocked = self.mock_value(&value)?;
            self.heap.set_property(mock, key, mocked)?;
        }
        Ok(())
    }

    /// Own slots first, then inherited ones not shadowed, skipping inherited
    /// `constructor`.
    fn slots(&self, handle: ObjectHandle) -> HeapResult<Vec<(String, JsValue)>> {
        let mut seen = BTreeSet::new();
        let mut out = Vec::new();
        let mut current = Some(handle);
        let mut depth = 0;
        while let Some(h) = current {
            if depth >= MAX_SLOT_DEPTH {
                break;
            }
            let object = self.heap.get(h)?;
            for (key, value) in &object.properties {
                if depth > 0 && key == "constructor" {
                    continue;
                }
                if seen.insert(key.clone()) {
                    out.push((key.clone(), value.clone()));
                }
            }
            current = object.prototype;
            depth += 1;
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::{Builtin, Callable, ErrorKind, MOCK_FUNCTION_MARKER};

    /// Any callable will do; the synthesizer only looks at shape.
    fn builtin_fn(heap: &mut Heap, name: &str) -> JsValue {
        JsValue::Object(heap.alloc_function(
            name,
            Callable::Builtin(Builtin::ErrorCtor(ErrorKind::Error)),
        ))
    }

    fn prop(heap: &Heap, value: &JsValue, key: &str) -> JsValue {
        heap.get_property(value.as_object().expect("object"), key)
            .expect("property")
    }

    #[test]
    fn functions_become_mocks_and_primitives_pass_through() {
        let mut heap = Heap::new();
        let f = builtin_fn(&mut heap, "setModuleStateValue");
        let list = JsValue::Object(heap.alloc_array(vec![JsValue::Number(1.0)]));
        let exports = JsValue::Object(heap.object_from_entries(vec![
            ("setModuleStateValue".to_string(), f),
            ("count".to_string(), JsValue::Number(3.0)),
            ("label".to_string(), JsValue::str("x")),
            ("items".to_string(), list),
        ]));

        let (mock, stats) = synthesize_with_stats(&mut heap, &exports).expect("synthesize");
        assert_ne!(mock, exports);
        let fn_mock = prop(&heap, &mock, "setModuleStateValue");
        assert!(heap.is_mock_function(&fn_mock));
        assert_eq!(prop(&heap, &fn_mock, MOCK_FUNCTION_MARKER), JsValue::Bool(true));
        assert_eq!(prop(&heap, &fn_mock, "name"), JsValue::str("setModuleStateValue"));
        assert_eq!(prop(&heap, &mock, "count"), JsValue::Number(3.0));
        assert_eq!(prop(&heap, &mock, "label"), JsValue::str("x"));
        let items = prop(&heap, &mock, "items");
        assert_eq!(prop(&heap, &items, "length"), JsValue::Number(0.0));
        assert_eq!(stats.functions, 1);
    }

    #[test]
    fn nested_objects_are_mirrored_recursively() {
        let mut heap = Heap::new();
        let inner_fn = builtin_fn(&mut heap, "deep");
        let inner = JsValue::Object(
            heap.object_from_entries(vec![("deep".to_string(), inner_fn)]),
        );
        let outer = JsValue::Object(heap.object_from_entries(vec![("inner".to_string(), inner)]));
        let mock = synthesize(&mut heap, &outer).expect("synthesize");
        let mocked_inner = prop(&heap, &mock, "inner");
        assert!(heap.is_mock_function(&prop(&heap, &mocked_inner, "deep")));
    }

    #[test]
    fn shared_and_cyclic_references_are_preserved() {
        let mut heap = Heap::new();
        let shared = heap.alloc_plain();
        let root = heap.alloc_plain();
        heap.set_property(root, "a", JsValue::Object(shared)).expect("a");
        heap.set_property(root, "b", JsValue::Object(shared)).expect("b");
        heap.set_property(root, "self", JsValue::Object(root)).expect("self");

        let mock = synthesize(&mut heap, &JsValue::Object(root)).expect("synthesize");
        let a = prop(&heap, &mock, "a");
        let b = prop(&heap, &mock, "b");
        assert!(a.strict_equals(&b));
        assert_ne!(a, JsValue::Object(shared));
        assert!(prop(&heap, &mock, "self").strict_equals(&mock));
    }

    #[test]
    fn class_like_functions_get_mocked_prototypes() {
        let mut heap = Heap::new();
        let method = builtin_fn(&mut heap, "area");
        let class = builtin_fn(&mut heap, "Shape");
        let proto = heap.object_from_entries(vec![
            ("constructor".to_string(), class.clone()),
            ("area".to_string(), method),
        ]);
        heap.set_property(class.as_object().expect("class"), "prototype", JsValue::Object(proto))
            .expect("prototype");

        let mock = synthesize(&mut heap, &class).expect("synthesize");
        assert!(heap.is_mock_function(&mock));
        let mock_proto = prop(&heap, &mock, "prototype");
        assert_ne!(mock_proto, JsValue::Object(proto));
        assert!(heap.is_mock_function(&prop(&heap, &mock_proto, "area")));
        assert!(prop(&heap, &mock_proto, "constructor").strict_equals(&mock));
    }

    #[test]
    fn plain_function_prototypes_are_not_copied() {
        let mut heap = Heap::new();
        let f = builtin_fn(&mut heap, "plain");
        let proto = heap.object_from_entries(vec![("constructor".to_string(), f.clone())]);
        heap.set_property(f.as_object().expect("fn"), "prototype", JsValue::Object(proto))
            .expect("prototype");
        let mock = synthesize(&mut heap, &f).expect("synthesize");
        assert_eq!(prop(&heap, &mock, "prototype"), JsValue::Undefined);
    }

    #[test]
    fn synthesis_fills_a_reserved_object_in_place() {
        let mut heap = Heap::new();
        let reserved = heap.alloc_plain();
        let f = builtin_fn(&mut heap, "load");
        let real = JsValue::Object(heap.object_from_entries(vec![("load".to_string(), f)]));
        heap.set_property(real.as_object().expect("real"), "self", real.clone())
            .expect("self");

        let (mock, stats) = synthesize_into(&mut heap, &real, reserved).expect("synthesize");
        assert_eq!(mock, JsValue::Object(reserved));
        assert!(heap.is_mock_function(&prop(&heap, &mock, "load")));
        assert!(prop(&heap, &mock, "self").strict_equals(&mock));
        assert_eq!(stats.objects, 1);

        let target = heap.alloc_plain();
        let class = builtin_fn(&mut heap, "Client");
        let (mock_fn, _) = synthesize_into(&mut heap, &class, target).expect("function");
        assert_eq!(mock_fn, JsValue::Object(target));
        assert!(heap.is_mock_function(&mock_fn));
        assert_eq!(prop(&heap, &mock_fn, "name"), JsValue::str("Client"));

        let untouched = heap.alloc_plain();
        let (primitive, _) =
            synthesize_into(&mut heap, &JsValue::Number(2.0), untouched).expect("primitive");
        assert_eq!(primitive, JsValue::Number(2.0));
    }

    #[test]
    fn inherited_members_of_instances_are_mirrored() {
        let mut heap = Heap::new();
        let method = builtin_fn(&mut heap, "greet");
        let proto = heap.object_from_entries(vec![("greet".to_string(), method)]);
        let instance = heap.alloc(ObjectKind::Plain, Some(proto));
        heap.set_property(instance, "name", JsValue::str("n")).expect("name");
        let mock = synthesize(&mut heap, &JsValue::Object(instance)).expect("synthesize");
        assert!(heap.is_mock_function(&prop(&heap, &mock, "greet")));
        assert_eq!(prop(&heap, &mock, "name"), JsValue::str("n"));
    }
}
