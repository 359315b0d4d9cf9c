//! Collection types.

/// A hash map based on `hashbrown` ([`HashMap`][hashbrown::HashMap]) using `foldhash` for hashing.
pub type FastHashMap<K, V> = hashbrown::HashMap<K, V, FastBuildHasher>;

/// [`BuildHasher`][std::hash::BuildHasher] implementation used by [`FastHashMap`].
pub type FastBuildHasher = foldhash::quality::RandomState;
