//! Managed type metadata and the algorithms that derive it: C3 method
//! resolution order, solid base and best base selection.

use crate::ObjectId;
use indexmap::IndexMap;
use itertools::Itertools;

bitflags::bitflags! {
    #[derive(Copy, Clone, Debug, PartialEq, Eq, Default)]
    pub struct TypeFlags: u64 {
        /// Created at run time by a class statement rather than baked in.
        const HEAPTYPE = 1 << 9;
        const BASETYPE = 1 << 10;
        /// Mirrors a type descriptor that native code defined.
        const NATIVE = 1 << 11;
        const ABSTRACT = 1 << 20;
    }
}

/// The instance layout a type inherits from its solid base.
///
/// Families form a chain through [`parent`](Self::parent) that always ends at
/// [`Object`](Self::Object).
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum TypeFamily {
    Object,
    NoneType,
    Type,
    Int,
    Bool,
    Str,
    Tuple,
    Function,
    BaseException,
}

impl TypeFamily {
    pub const fn parent(self) -> Option<Self> {
        match self {
            Self::Object => None,
            Self::Bool => Some(Self::Int),
            _ => Some(Self::Object),
        }
    }

    /// `self`, then each parent up to and including `Object`.
    pub fn chain(self) -> impl Iterator<Item = Self> {
        core::iter::successors(Some(self), |family| family.parent())
    }

    pub const fn name(self) -> &'static str {
        match self {
            Self::Object => "object",
            Self::NoneType => "NoneType",
            Self::Type => "type",
            Self::Int => "int",
            Self::Bool => "bool",
            Self::Str => "str",
            Self::Tuple => "tuple",
            Self::Function => "function",
            Self::BaseException => "BaseException",
        }
    }
}

#[derive(Debug)]
pub struct TypeData {
    pub name: String,
    pub doc: Option<String>,
    /// Direct bases in declaration order.
    pub bases: Vec<ObjectId>,
    /// The best base: the direct base whose layout this type extends.
    pub base: Option<ObjectId>,
    /// Method resolution order, starting with the type itself.
    pub mro: Vec<ObjectId>,
    pub dict: IndexMap<String, ObjectId>,
    pub flags: TypeFlags,
    pub family: TypeFamily,
}

impl TypeData {
    pub fn is_heap_type(&self) -> bool {
        self.flags.contains(TypeFlags::HEAPTYPE)
    }

    pub(crate) fn trace(&self, tracer: &mut impl FnMut(ObjectId)) {
        self.bases.iter().copied().for_each(&mut *tracer);
        self.base.into_iter().for_each(&mut *tracer);
        self.mro.iter().copied().for_each(&mut *tracer);
        self.dict.values().copied().for_each(tracer);
    }
}

/// Everything needed to create a type with [`Heap::new_type`](crate::Heap::new_type).
#[derive(Debug, Default)]
pub struct TypeSpec {
    pub name: String,
    pub doc: Option<String>,
    /// Empty means `(object,)`.
    pub bases: Vec<ObjectId>,
    pub dict: IndexMap<String, ObjectId>,
    pub flags: TypeFlags,
    /// Defaults to `type`.
    pub metaclass: Option<ObjectId>,
}

impl TypeSpec {
    /// A subclassable type as a class statement would build it.
    pub fn heap(name: impl Into<String>, bases: Vec<ObjectId>) -> Self {
        Self {
            name: name.into(),
            bases,
            flags: TypeFlags::HEAPTYPE | TypeFlags::BASETYPE,
            ..Default::default()
        }
    }

    pub fn with_dict(mut self, dict: IndexMap<String, ObjectId>) -> Self {
        self.dict = dict;
        self
    }

    pub fn with_doc(mut self, doc: impl Into<String>) -> Self {
        self.doc = Some(doc.into());
        self
    }
}

fn take_next_base(bases: &mut [Vec<ObjectId>]) -> Option<ObjectId> {
    for base in bases.iter() {
        let head = base[0];
        if !bases.iter().any(|x| x[1..].contains(&head)) {
            // Remove from other heads.
            for item in bases.iter_mut() {
                if item[0] == head {
                    item.remove(0);
                }
            }

            return Some(head);
        }
    }

    None
}

/// C3 merge of the bases' MROs. Each input list starts with the base itself.
pub(crate) fn linearise_mro(
    mut bases: Vec<Vec<ObjectId>>,
    type_name: impl Fn(ObjectId) -> String,
) -> Result<Vec<ObjectId>, String> {
    trace!("Linearise MRO: {bases:?}");
    // Local precedence ordering: for A() and B(A), C(A, B) must be rejected even
    // though the merge alone would produce [C, B, A, object].
    for (i, base_mro) in bases.iter().enumerate() {
        let base = base_mro[0];
        for later_mro in &bases[i + 1..] {
            if later_mro[1..].contains(&base) {
                return Err(
                    "Unable to find mro order which keeps local precedence ordering".to_owned(),
                );
            }
        }
    }

    let mut result = vec![];
    while !bases.is_empty() {
        let head = take_next_base(&mut bases).ok_or_else(|| {
            // The lists cannot be empty here, they are pruned after every step.
            format!(
                "Cannot create a consistent method resolution order (MRO) for bases {}",
                bases.iter().map(|x| type_name(x[0])).format(", ")
            )
        })?;

        result.push(head);

        bases.retain(|x| !x.is_empty());
    }
    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(n: u64) -> ObjectId {
        ObjectId::from_raw(n).unwrap()
    }

    fn name(id: ObjectId) -> String {
        format!("T{}", id.get())
    }

    #[test]
    fn test_family_chain_ends_at_object() {
        let chain: Vec<_> = TypeFamily::Bool.chain().collect();
        assert_eq!(
            chain,
            [TypeFamily::Bool, TypeFamily::Int, TypeFamily::Object]
        );
        assert_eq!(TypeFamily::Object.chain().count(), 1);
    }

    #[test]
    fn test_linearise_diamond() {
        // object=1, A=2(object), B=3(A), C=4(A); D(B, C)
        let object = id(1);
        let (a, b, c) = (id(2), id(3), id(4));
        let mro = linearise_mro(vec![vec![b, a, object], vec![c, a, object]], name).unwrap();
        assert_eq!(mro, [b, c, a, object]);
    }

    #[test]
    fn test_linearise_rejects_bad_local_order() {
        let object = id(1);
        let (a, b) = (id(2), id(3));
        let err = linearise_mro(vec![vec![a, object], vec![b, a, object]], name).unwrap_err();
        assert!(err.contains("local precedence"), "{err}");
    }
}
