use serde::{Deserialize, Serialize};

/// Conjunto de bits de tamaño fijo.
///
/// Se usa para marcar tareas completadas y orígenes recibidos. Un job
/// regional puede tener millones de orígenes, así que guardamos 64 bits
/// por palabra en vez de un `Vec<bool>`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BitSet {
    words: Vec<u64>,
    len: usize,
}

impl BitSet {
    pub fn new(len: usize) -> Self {
        Self {
            words: vec![0; len.div_ceil(64)],
            len,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Índices fuera de rango se leen como `false`.
    pub fn get(&self, index: usize) -> bool {
        if index >= self.len {
            return false;
        }
        self.words[index / 64] & (1 << (index % 64)) != 0
    }

    /// Marca el bit. Devuelve `true` solo si antes no estaba marcado,
    /// y `false` si ya estaba o si el índice está fuera de rango.
    pub fn set(&mut self, index: usize) -> bool {
        if index >= self.len {
            return false;
        }
        let word = &mut self.words[index / 64];
        let mask = 1 << (index % 64);
        if *word & mask != 0 {
            return false;
        }
        *word |= mask;
        true
    }

    /// Cantidad de bits marcados.
    pub fn cardinality(&self) -> usize {
        self.words.iter().map(|w| w.count_ones() as usize).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_devuelve_true_solo_la_primera_vez() {
        let mut bits = BitSet::new(10);
        assert!(bits.set(3));
        assert!(!bits.set(3));
        assert!(bits.get(3));
        assert_eq!(bits.cardinality(), 1);
    }

    #[test]
    fn indices_fuera_de_rango_se_ignoran() {
        let mut bits = BitSet::new(5);
        assert!(!bits.set(5));
        assert!(!bits.get(5));
        assert!(!bits.get(1_000));
        assert_eq!(bits.cardinality(), 0);
    }

    #[test]
    fn cardinality_cruza_palabras() {
        let mut bits = BitSet::new(200);
        for i in [0, 63, 64, 127, 128, 199] {
            bits.set(i);
        }
        assert_eq!(bits.cardinality(), 6);
        assert!(bits.get(64));
        assert!(!bits.get(65));
    }

    #[test]
    fn bitset_vacio() {
        let bits = BitSet::new(0);
        assert!(bits.is_empty());
        assert_eq!(bits.cardinality(), 0);
    }
}
