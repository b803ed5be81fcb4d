use std::cell::RefCell;
use std::rc::Rc;

/// Recycles scratch allocations on the loop thread.
///
/// The I/O driver borrows a buffer per socket read and returns it when
/// the pass is over; steady-state polling then allocates nothing. Not
/// thread-safe on purpose: everything that touches a pool lives on
/// the loop thread.
pub struct ObjectPool<T> {
    free: Rc<RefCell<Vec<T>>>,
    create: Rc<dyn Fn() -> T>,
}

impl<T> Clone for ObjectPool<T> {
    fn clone(&self) -> Self {
        Self {
            free: self.free.clone(),
            create: self.create.clone(),
        }
    }
}

impl<T> ObjectPool<T> {
    pub fn new<F>(initial_size: usize, create_fn: F) -> Self
    where
        F: Fn() -> T + 'static,
    {
        let free: Vec<T> = (0..initial_size).map(|_| create_fn()).collect();
        Self {
            free: Rc::new(RefCell::new(free)),
            create: Rc::new(create_fn),
        }
    }

    pub fn acquire(&self) -> PooledObject<T> {
        let object = self
            .free
            .borrow_mut()
            .pop()
            .unwrap_or_else(|| (self.create)());
        PooledObject {
            object: Some(object),
            free: self.free.clone(),
        }
    }

    pub fn idle(&self) -> usize {
        self.free.borrow().len()
    }
}

/// Guard that hands its object back to the pool on drop.
pub struct PooledObject<T> {
    object: Option<T>,
    free: Rc<RefCell<Vec<T>>>,
}

impl<T> std::ops::Deref for PooledObject<T> {
    type Target = T;

    fn deref(&self) -> &T {
        self.object.as_ref().expect("pooled object taken")
    }
}

impl<T> std::ops::DerefMut for PooledObject<T> {
    fn deref_mut(&mut self) -> &mut T {
        self.object.as_mut().expect("pooled object taken")
    }
}

impl<T> Drop for PooledObject<T> {
    fn drop(&mut self) {
        if let Some(object) = self.object.take() {
            self.free.borrow_mut().push(object);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_acquire_reuses_returned_objects() {
        let pool: ObjectPool<Vec<u8>> = ObjectPool::new(1, || vec![0u8; 16]);
        assert_eq!(pool.idle(), 1);
        {
            let mut buf = pool.acquire();
            buf[0] = 7;
            assert_eq!(pool.idle(), 0);
        }
        assert_eq!(pool.idle(), 1);
        let buf = pool.acquire();
        // Same backing object came back.
        assert_eq!(buf[0], 7);
    }

    #[test]
    fn test_empty_pool_creates_on_demand() {
        let pool: ObjectPool<String> = ObjectPool::new(0, || String::from("fresh"));
        let a = pool.acquire();
        let b = pool.acquire();
        assert_eq!(*a, "fresh");
        assert_eq!(*b, "fresh");
        drop(a);
        drop(b);
        assert_eq!(pool.idle(), 2);
    }
}
