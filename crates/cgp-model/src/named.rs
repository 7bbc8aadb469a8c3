use crate::error::{ModelError, Result};
use std::cell::{Ref, RefCell};
use std::collections::BTreeMap;
use std::fmt;
use std::ops::Range;
use std::rc::Rc;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Layout {
    fields: Vec<(String, usize)>,
    offsets: Vec<usize>,
    index: BTreeMap<String, usize>,
    len: usize,
}

impl Layout {
    pub fn new<S: Into<String>>(fields: impl IntoIterator<Item = (S, usize)>) -> Result<Self> {
        let mut out = Layout {
            fields: Vec::new(),
            offsets: Vec::new(),
            index: BTreeMap::new(),
            len: 0,
        };
        for (name, width) in fields {
            let name = name.into();
            if out.index.contains_key(&name) {
                return Err(ModelError::DuplicateField(name));
            }
            out.index.insert(name.clone(), out.fields.len());
            out.offsets.push(out.len);
            out.len += width;
            out.fields.push((name, width));
        }
        Ok(out)
    }

    pub fn scalars<S: AsRef<str>>(names: &[S]) -> Result<Self> {
        Layout::new(names.iter().map(|n| (n.as_ref().to_string(), 1)))
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn fields(&self) -> &[(String, usize)] {
        &self.fields
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.fields.iter().map(|(n, _)| n.as_str())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.index.contains_key(name)
    }

    pub fn index_of(&self, name: &str) -> Option<usize> {
        self.index.get(name).copied()
    }

    /// Flat positions covered by the field.
    pub fn range_of(&self, name: &str) -> Option<Range<usize>> {
        let i = self.index_of(name)?;
        let start = self.offsets[i];
        Some(start..start + self.fields[i].1)
    }
}

#[derive(Clone)]
pub struct StateBuffer(Rc<RefCell<Vec<f64>>>);

impl StateBuffer {
    pub fn new(values: Vec<f64>) -> Self {
        StateBuffer(Rc::new(RefCell::new(values)))
    }

    pub fn zeros(len: usize) -> Self {
        StateBuffer::new(vec![0.0; len])
    }

    pub fn len(&self) -> usize {
        self.0.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn to_vec(&self) -> Vec<f64> {
        self.0.borrow().clone()
    }

    pub fn assign(&self, values: &[f64]) -> Result<()> {
        let mut buf = self.0.borrow_mut();
        if buf.len() != values.len() {
            return Err(ModelError::ShapeMismatch {
                target: "buffer".to_string(),
                expected: buf.len(),
                found: values.len(),
            });
        }
        buf.copy_from_slice(values);
        Ok(())
    }

    /// Panics if `i` is out of bounds, like slice indexing.
    pub fn get(&self, i: usize) -> f64 {
        self.0.borrow()[i]
    }

    /// Panics if `i` is out of bounds, like slice indexing.
    pub fn set(&self, i: usize, value: f64) {
        self.0.borrow_mut()[i] = value;
    }

    pub fn with<R>(&self, f: impl FnOnce(&[f64]) -> R) -> R {
        f(&self.0.borrow())
    }

    pub fn with_mut<R>(&self, f: impl FnOnce(&mut [f64]) -> R) -> R {
        f(&mut self.0.borrow_mut())
    }

    pub(crate) fn borrow(&self) -> Ref<'_, Vec<f64>> {
        self.0.borrow()
    }

    pub fn same_buffer(&self, other: &StateBuffer) -> bool {
        Rc::ptr_eq(&self.0, &other.0)
    }
}

impl fmt::Debug for StateBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "StateBuffer({:?})", self.0.borrow())
    }
}

pub struct NamedView {
    label: String,
    layout: Rc<Layout>,
    buffer: StateBuffer,
    snapshot: RefCell<Vec<f64>>,
}

impl NamedView {
    pub fn new(label: impl Into<String>, layout: Rc<Layout>, buffer: StateBuffer) -> Result<Self> {
        let label = label.into();
        if layout.len() != buffer.len() {
            return Err(ModelError::ShapeMismatch {
                target: label,
                expected: layout.len(),
                found: buffer.len(),
            });
        }
        let snapshot = RefCell::new(buffer.to_vec());
        Ok(NamedView {
            label,
            layout,
            buffer,
            snapshot,
        })
    }

    /// Copy the live buffer into the snapshot.
    pub fn sync_in(&self) {
        self.buffer
            .with(|live| self.snapshot.borrow_mut().copy_from_slice(live));
    }

    /// Copy the snapshot into the live buffer.
    pub fn sync_out(&self) {
        let snap = self.snapshot.borrow();
        self.buffer.with_mut(|live| live.copy_from_slice(&snap));
    }

    pub fn read(&self, name: &str) -> Result<Vec<f64>> {
        let range = self.range(name)?;
        self.sync_in();
        Ok(self.snapshot.borrow()[range].to_vec())
    }

    pub fn get(&self, name: &str) -> Result<f64> {
        let values = self.read(name)?;
        match values.as_slice() {
            [v] => Ok(*v),
            _ => Err(ModelError::ShapeMismatch {
                target: format!("{}.{}", self.label, name),
                expected: 1,
                found: values.len(),
            }),
        }
    }

    pub fn write(&self, name: &str, values: &[f64]) -> Result<()> {
        let range = self.range(name)?;
        if range.len() != values.len() {
            return Err(ModelError::ShapeMismatch {
                target: format!("{}.{}", self.label, name),
                expected: range.len(),
                found: values.len(),
            });
        }
        self.sync_in();
        self.snapshot.borrow_mut()[range].copy_from_slice(values);
        self.sync_out();
        Ok(())
    }

    pub fn set(&self, name: &str, value: f64) -> Result<()> {
        let range = self.range(name)?;
        self.sync_in();
        self.snapshot.borrow_mut()[range].fill(value);
        self.sync_out();
        Ok(())
    }

    pub fn to_vec(&self) -> Vec<f64> {
        self.sync_in();
        self.snapshot.borrow().clone()
    }

    pub fn to_map(&self) -> Vec<(String, Vec<f64>)> {
        self.sync_in();
        let snap = self.snapshot.borrow();
        let map = self
            .layout
            .fields()
            .iter()
            .filter_map(|(name, _)| {
                let range = self.layout.range_of(name)?;
                Some((name.clone(), snap[range].to_vec()))
            })
            .collect();
        map
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn layout(&self) -> &Layout {
        &self.layout
    }

    pub(crate) fn layout_rc(&self) -> Rc<Layout> {
        Rc::clone(&self.layout)
    }

    pub fn buffer(&self) -> &StateBuffer {
        &self.buffer
    }

    pub fn contains(&self, name: &str) -> bool {
        self.layout.contains(name)
    }

    pub fn len(&self) -> usize {
        self.layout.len()
    }

    pub fn is_empty(&self) -> bool {
        self.layout.is_empty()
    }

    pub(crate) fn range(&self, name: &str) -> Result<Range<usize>> {
        self.layout
            .range_of(name)
            .ok_or_else(|| ModelError::UnknownField {
                name: name.to_string(),
                vector: self.label.clone(),
            })
    }
}

impl fmt::Debug for NamedView {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: Vec<&str> = self.layout.names().collect();
        write!(f, "NamedView({:?}, {:?})", self.buffer.to_vec(), names)
    }
}
