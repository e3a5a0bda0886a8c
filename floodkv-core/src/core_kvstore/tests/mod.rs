mod convergence_tests;
